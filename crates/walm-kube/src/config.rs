//! Process configuration
//!
//! Loaded from a YAML file; every section and field has a default so an
//! empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use walm_repo::{Repository, RepositoryConfig};

use crate::error::{Result, WalmError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalmConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub task: TaskConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub kube: KubeConfig,

    #[serde(default)]
    pub listing: ListingConfig,

    /// Chart repositories and registries
    #[serde(default)]
    pub repositories: Vec<Repository>,

    #[serde(default)]
    pub log: LogConfig,
}

impl WalmConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| WalmError::InvalidArgument(format!("invalid configuration: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WalmError::InvalidArgument(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn repository_config(&self) -> RepositoryConfig {
        RepositoryConfig::new(self.repositories.clone())
    }
}

/// Release Store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory, lost on restart
    #[default]
    Memory,
    /// One Kubernetes Secret per key
    Secrets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Namespace holding the Secrets of the `secrets` backend
    #[serde(default = "default_store_namespace")]
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            namespace: default_store_namespace(),
        }
    }
}

fn default_store_namespace() -> String {
    "walm-system".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Tasks running at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Submitted but unfinished tasks accepted before submits are rejected
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,

    #[serde(default = "default_task_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Project tasks running at the same time, on a pool of their own
    #[serde(default = "default_project_concurrency")]
    pub project_concurrency: usize,

    /// How long a finished task's state can still be queried
    #[serde(default = "default_state_retention", with = "humantime_serde")]
    pub state_retention: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_limit: default_queue_limit(),
            default_timeout: default_task_timeout(),
            project_concurrency: default_project_concurrency(),
            state_retention: default_state_retention(),
        }
    }
}

fn default_concurrency() -> usize {
    16
}

fn default_queue_limit() -> usize {
    1024
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_project_concurrency() -> usize {
    4
}

fn default_state_retention() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            interval: default_interval(),
        }
    }
}

fn default_attempts() -> u32 {
    5
}

fn default_interval() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfig {
    /// Per-namespace API handle cache capacity
    #[serde(default = "default_client_cache_capacity")]
    pub client_cache_capacity: usize,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            client_cache_capacity: default_client_cache_capacity(),
        }
    }
}

fn default_client_cache_capacity() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingConfig {
    /// Releases whose info is built at the same time
    #[serde(default = "default_listing_concurrency")]
    pub concurrency: usize,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_listing_concurrency(),
        }
    }
}

fn default_listing_concurrency() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
