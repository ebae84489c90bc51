//! Error types for walm-kube

use thiserror::Error;
use walm_core::CoreError;
use walm_engine::EngineError;
use walm_repo::RepoError;

/// Result type for walm-kube operations
pub type Result<T> = std::result::Result<T, WalmError>;

/// Message prefix of a submit rejected because a release task is running
pub const TASK_IN_FLIGHT_PREFIX: &str = "please wait for the last release task";

/// Message prefix of a submit rejected because a project task is running
pub const PROJECT_TASK_IN_FLIGHT_PREFIX: &str = "please wait for the last project task";

const CONNECTION_RESET: &str = "connection reset";

/// Errors surfaced by the release core
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalmError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    /// Submit while the previous release task is not finished
    #[error("please wait for the last release task {namespace}/{name} to finish: {task}")]
    TaskInFlight {
        namespace: String,
        name: String,
        task: String,
    },

    #[error("please wait for the last project task {namespace}/{name} to finish: {task}")]
    ProjectTaskInFlight {
        namespace: String,
        name: String,
        task: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Strict dependency resolution found no ReleaseConfig
    #[error("dependency '{alias}' of release: ReleaseConfig {namespace}/{name} does not exist")]
    UpstreamStrictMiss {
        alias: String,
        namespace: String,
        name: String,
    },

    #[error("render error: {0}")]
    Render(String),

    #[error("failed to apply release {namespace}/{name}: {message}")]
    Apply {
        namespace: String,
        name: String,
        message: String,
    },

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("plugin '{plugin}' failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("plugin '{name}' is not registered")]
    UnknownPlugin { name: String },

    #[error("dependency cycle between releases: {cycle}")]
    DependencyCycle { cycle: String },

    #[error("task runner error: {0}")]
    TaskRunner(String),

    #[error("operation timed out after {0}")]
    Timeout(String),

    /// Several independent failures, e.g. one per pod of a restart
    #[error("{}", errors.join("; "))]
    Aggregate { errors: Vec<String> },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("chart error: {0}")]
    Chart(String),
}

impl From<serde_json::Error> for WalmError {
    fn from(e: serde_json::Error) -> Self {
        WalmError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for WalmError {
    fn from(e: serde_yaml::Error) -> Self {
        WalmError::Serialization(e.to_string())
    }
}

impl From<CoreError> for WalmError {
    fn from(e: CoreError) -> Self {
        if e.is_invalid_argument() {
            WalmError::InvalidArgument(e.to_string())
        } else {
            WalmError::Chart(e.to_string())
        }
    }
}

impl From<EngineError> for WalmError {
    fn from(e: EngineError) -> Self {
        WalmError::Render(e.to_string())
    }
}

impl From<RepoError> for WalmError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::ChartNotFound { name, repo } => WalmError::NotFound {
                kind: "Chart".to_string(),
                namespace: repo,
                name,
            },
            RepoError::VersionNotFound {
                name,
                version,
                repo,
            } => WalmError::NotFound {
                kind: "Chart".to_string(),
                namespace: repo,
                name: format!("{}:{}", name, version),
            },
            RepoError::Chart(core) => core.into(),
            other => WalmError::Chart(other.to_string()),
        }
    }
}

impl WalmError {
    pub fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        WalmError::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Typed miss, or a 404 from the Kubernetes API
    pub fn is_not_found(&self) -> bool {
        match self {
            WalmError::NotFound { .. } => true,
            WalmError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Errors the retry wrappers back off on
    pub fn is_retryable(&self) -> bool {
        let message = self.to_string();
        message.starts_with(TASK_IN_FLIGHT_PREFIX)
            || message.starts_with(PROJECT_TASK_IN_FLIGHT_PREFIX)
            || message.to_lowercase().contains(CONNECTION_RESET)
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, WalmError::InvalidArgument(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_message_prefix() {
        let err = WalmError::TaskInFlight {
            namespace: "a".into(),
            name: "r".into(),
            task: "Delete-Release-Task".into(),
        };
        assert!(err.to_string().starts_with(TASK_IN_FLIGHT_PREFIX));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_connection_reset_is_retryable() {
        assert!(WalmError::TransientIo("read: Connection reset by peer".into()).is_retryable());
        assert!(!WalmError::Store("disk full".into()).is_retryable());
        assert!(!WalmError::InvalidArgument("bad".into()).is_retryable());
    }

    #[test]
    fn test_repo_misses_map_to_not_found() {
        let err: WalmError = RepoError::VersionNotFound {
            name: "zk".into(),
            version: "1.0.0".into(),
            repo: "stable".into(),
        }
        .into();
        assert!(err.is_not_found());

        let err: WalmError = RepoError::NoSource {
            message: "nothing".into(),
        }
        .into();
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_core_invalid_argument_is_preserved() {
        let err: WalmError = walm_core::Statement::parse("zk.port").unwrap_err().into();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_aggregate_joins_messages() {
        let err = WalmError::Aggregate {
            errors: vec!["pod a: gone".into(), "pod b: busy".into()],
        };
        assert_eq!(err.to_string(), "pod a: gone; pod b: busy");
    }
}
