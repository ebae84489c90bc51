//! Chart source errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("chart repository {name} is not configured")]
    RepositoryNotFound { name: String },

    #[error("bad repository url {url}: {reason}")]
    InvalidRepositoryUrl { url: String, reason: String },

    #[error("repository returned HTTP {status}: {message}")]
    HttpError { status: u16, message: String },

    /// Connection-level failure, including timeouts
    #[error("repository unreachable: {message}")]
    NetworkError { message: String },

    #[error("cannot parse repository index: {message}")]
    IndexParseError { message: String },

    #[error("chart {name} not found in repository {repo}")]
    ChartNotFound { name: String, repo: String },

    #[error("chart {name} has no version {version} in repository {repo}")]
    VersionNotFound {
        name: String,
        version: String,
        repo: String,
    },

    #[error("digest mismatch for {name}: index says {expected}, archive is {actual}")]
    IntegrityCheckFailed {
        name: String,
        expected: String,
        actual: String,
    },

    /// Request names neither files, an image nor a repository chart
    #[error("no chart source: {message}")]
    NoSource { message: String },

    #[error("invalid chart: {0}")]
    Chart(#[from] walm_core::CoreError),

    #[error("registry error: {message}")]
    OciError { message: String },

    #[error("invalid chart image reference {reference}")]
    InvalidOciReference { reference: String },

    #[error("cannot read local chart: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    /// True for a chart or version the source does not have
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RepoError::ChartNotFound { .. }
                | RepoError::VersionNotFound { .. }
                | RepoError::RepositoryNotFound { .. }
                | RepoError::HttpError { status: 404, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RepoError>;

impl From<reqwest::Error> for RepoError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => RepoError::HttpError {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => RepoError::NetworkError {
                message: e.to_string(),
            },
        }
    }
}

impl From<serde_yaml::Error> for RepoError {
    fn from(e: serde_yaml::Error) -> Self {
        RepoError::IndexParseError {
            message: e.to_string(),
        }
    }
}

impl From<url::ParseError> for RepoError {
    fn from(e: url::ParseError) -> Self {
        RepoError::InvalidRepositoryUrl {
            url: String::new(),
            reason: e.to_string(),
        }
    }
}
