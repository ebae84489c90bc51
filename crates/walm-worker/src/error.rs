//! Worker error types

use miette::Diagnostic;
use thiserror::Error;
use walm_kube::WalmError;

#[derive(Error, Debug, Diagnostic)]
pub enum WorkerError {
    #[error("Configuration error: {message}")]
    #[diagnostic(code(walm::worker::config))]
    Config {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error("Cannot connect to the cluster: {message}")]
    #[diagnostic(
        code(walm::worker::cluster),
        help("check KUBECONFIG or the in-cluster service account")
    )]
    Cluster { message: String },

    #[error("Logging setup failed: {message}")]
    #[diagnostic(code(walm::worker::logging))]
    Logging { message: String },

    #[error(transparent)]
    #[diagnostic(code(walm::worker::release))]
    Release(#[from] WalmError),

    #[error("IO error: {0}")]
    #[diagnostic(code(walm::worker::io))]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
