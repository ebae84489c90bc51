//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error("Invalid chart: {message}")]
    InvalidChart { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("Values error: {message}")]
    Values { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Invalid dependency statement '{statement}' at position {position}: {reason}")]
    InvalidStatement {
        statement: String,
        position: usize,
        reason: String,
    },

    #[error("Duplicate plugin '{name}' in {source_list} plugin list")]
    DuplicatePlugin { name: String, source_list: String },

    #[error("Invalid manifest: {message}")]
    InvalidManifest { message: String },

    #[error("Archive error: {message}")]
    Archive { message: String },
}

impl CoreError {
    /// Errors caused by caller input rather than by the environment
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidArgument { .. }
                | CoreError::InvalidStatement { .. }
                | CoreError::DuplicatePlugin { .. }
                | CoreError::MissingField { .. }
        )
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        CoreError::InvalidArgument {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
