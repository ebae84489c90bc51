//! Release Store
//!
//! Persistent cache of release task pointers, last successful renders,
//! backups of deleted releases and project task pointers. Records are JSON
//! blobs keyed `{kind}:{namespace}:{name}` in a [`KvBackend`]:
//! - **Memory**: process-local map, used by tests and single-node setups
//! - **Secrets**: one Kubernetes Secret per key, zstd compressed

mod memory;
mod secrets;

pub use memory::{MemoryBackend, OperationCounts};
pub use secrets::SecretsBackend;

use async_trait::async_trait;
use glob::Pattern;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;
use walm_core::{ProjectTask, ReleaseCache, ReleaseConfig, ReleaseInfoV2, ReleaseTask};

use crate::error::{Result, WalmError};

/// Key-value backend behind the Release Store
///
/// `delete` of a missing key succeeds.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Every entry whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Record kinds, the first key segment
pub mod record {
    pub const TASK: &str = "task";
    pub const CACHE: &str = "cache";
    pub const BACKUP: &str = "backup";
    pub const PROJECT_TASK: &str = "project-task";

    pub const ALL: [&str; 4] = [TASK, CACHE, BACKUP, PROJECT_TASK];
}

/// `{kind}:{namespace}:{name}`
pub fn record_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}:{}:{}", kind, namespace, name)
}

/// Split a record key back into its three segments
pub fn split_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, ':');
    let kind = parts.next()?;
    let namespace = parts.next()?;
    let name = parts.next()?;
    Some((kind, namespace, name))
}

fn list_prefix(kind: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        format!("{}:", kind)
    } else {
        format!("{}:{}:", kind, namespace)
    }
}

/// Name filter: a glob, where empty means everything
fn name_filter(filter: &str) -> Result<Option<Pattern>> {
    if filter.is_empty() || filter == "*" {
        return Ok(None);
    }
    Pattern::new(filter)
        .map(Some)
        .map_err(|e| WalmError::InvalidArgument(format!("invalid name filter '{}': {}", filter, e)))
}

/// Typed access to release records
#[derive(Clone)]
pub struct ReleaseStore {
    backend: Arc<dyn KvBackend>,
}

impl ReleaseStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Store over a fresh [`MemoryBackend`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    async fn get_record<T: DeserializeOwned>(&self, kind: &str, namespace: &str, name: &str) -> Result<T> {
        let key = record_key(kind, namespace, name);
        let data = self
            .backend
            .get(&key)
            .await?
            .ok_or_else(|| WalmError::not_found(kind, namespace, name))?;
        serde_json::from_slice(&data)
            .map_err(|e| WalmError::Store(format!("corrupt record {}: {}", key, e)))
    }

    async fn put_record<T: Serialize>(&self, kind: &str, namespace: &str, name: &str, value: &T) -> Result<()> {
        let key = record_key(kind, namespace, name);
        let data = serde_json::to_vec(value)?;
        self.backend.set(&key, data).await
    }

    async fn delete_record(&self, kind: &str, namespace: &str, name: &str) -> Result<()> {
        self.backend.delete(&record_key(kind, namespace, name)).await
    }

    async fn list_records<T: DeserializeOwned>(&self, kind: &str, namespace: &str, filter: &str) -> Result<Vec<T>> {
        let pattern = name_filter(filter)?;
        let entries = self.backend.list(&list_prefix(kind, namespace)).await?;

        let mut records = Vec::with_capacity(entries.len());
        for (key, data) in entries {
            let Some((_, _, name)) = split_key(&key) else {
                continue;
            };
            if pattern.as_ref().is_some_and(|p| !p.matches(name)) {
                continue;
            }
            let record = serde_json::from_slice(&data)
                .map_err(|e| WalmError::Store(format!("corrupt record {}: {}", key, e)))?;
            records.push(record);
        }
        Ok(records)
    }

    // ============ Release tasks ============

    pub async fn get_release_task(&self, namespace: &str, name: &str) -> Result<ReleaseTask> {
        self.get_record(record::TASK, namespace, name).await
    }

    /// Tasks of `namespace` (all namespaces when empty) whose name matches `filter`
    pub async fn get_release_tasks(&self, namespace: &str, filter: &str) -> Result<Vec<ReleaseTask>> {
        self.list_records(record::TASK, namespace, filter).await
    }

    pub async fn create_or_update_release_task(&self, task: &ReleaseTask) -> Result<()> {
        self.put_record(record::TASK, &task.namespace, &task.name, task).await
    }

    pub async fn delete_release_task(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_record(record::TASK, namespace, name).await
    }

    /// Tasks of the releases owning the given ReleaseConfigs; misses are skipped
    pub async fn get_release_tasks_by_release_configs(
        &self,
        configs: &[ReleaseConfig],
    ) -> Result<Vec<ReleaseTask>> {
        let mut tasks = Vec::with_capacity(configs.len());
        for config in configs {
            match self.get_release_task(&config.namespace, &config.name).await {
                Ok(task) => tasks.push(task),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(tasks)
    }

    // ============ Release caches ============

    pub async fn get_release_cache(&self, namespace: &str, name: &str) -> Result<ReleaseCache> {
        self.get_record(record::CACHE, namespace, name).await
    }

    pub async fn get_release_caches(&self, namespace: &str, filter: &str) -> Result<Vec<ReleaseCache>> {
        self.list_records(record::CACHE, namespace, filter).await
    }

    pub async fn create_or_update_release_cache(&self, cache: &ReleaseCache) -> Result<()> {
        debug!(namespace = %cache.namespace(), release = %cache.name(), "writing release cache");
        self.put_record(record::CACHE, cache.namespace(), cache.name(), cache)
            .await
    }

    pub async fn delete_release_cache(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_record(record::CACHE, namespace, name).await
    }

    pub async fn get_release_caches_by_release_configs(
        &self,
        configs: &[ReleaseConfig],
    ) -> Result<Vec<ReleaseCache>> {
        let mut caches = Vec::with_capacity(configs.len());
        for config in configs {
            match self.get_release_cache(&config.namespace, &config.name).await {
                Ok(cache) => caches.push(cache),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(caches)
    }

    // ============ Backups ============

    /// Keep the last known info of a deleted release
    pub async fn create_release_backup(&self, namespace: &str, name: &str, info: &ReleaseInfoV2) -> Result<()> {
        self.put_record(record::BACKUP, namespace, name, info).await
    }

    pub async fn get_release_backup(&self, namespace: &str, name: &str) -> Result<ReleaseInfoV2> {
        self.get_record(record::BACKUP, namespace, name).await
    }

    pub async fn list_release_backups(&self, namespace: &str) -> Result<Vec<ReleaseInfoV2>> {
        self.list_records(record::BACKUP, namespace, "").await
    }

    pub async fn delete_release_backup(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_record(record::BACKUP, namespace, name).await
    }

    // ============ Project tasks ============

    pub async fn get_project_task(&self, namespace: &str, name: &str) -> Result<ProjectTask> {
        self.get_record(record::PROJECT_TASK, namespace, name).await
    }

    pub async fn get_project_tasks(&self, namespace: &str, filter: &str) -> Result<Vec<ProjectTask>> {
        self.list_records(record::PROJECT_TASK, namespace, filter)
            .await
    }

    pub async fn create_or_update_project_task(&self, task: &ProjectTask) -> Result<()> {
        self.put_record(record::PROJECT_TASK, &task.namespace, &task.name, task)
            .await
    }

    pub async fn delete_project_task(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_record(record::PROJECT_TASK, namespace, name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walm_core::TaskSig;

    fn task(namespace: &str, name: &str) -> ReleaseTask {
        ReleaseTask {
            namespace: namespace.to_string(),
            name: name.to_string(),
            latest_task_sig: Some(TaskSig {
                name: "Create-Release-Task".to_string(),
                uuid: format!("{}-{}", namespace, name),
                timeout_sec: 60,
            }),
        }
    }

    fn cache(namespace: &str, name: &str) -> ReleaseCache {
        let mut cache = ReleaseCache::default();
        cache.spec.namespace = namespace.to_string();
        cache.spec.name = name.to_string();
        cache
    }

    #[test]
    fn test_key_format() {
        assert_eq!(record_key(record::TASK, "a", "r"), "task:a:r");
        assert_eq!(split_key("project-task:a:p"), Some(("project-task", "a", "p")));
        assert_eq!(split_key("broken"), None);
    }

    #[tokio::test]
    async fn test_task_crud() {
        let store = ReleaseStore::in_memory();
        let err = store.get_release_task("a", "r").await.unwrap_err();
        assert!(err.is_not_found());

        store.create_or_update_release_task(&task("a", "r")).await.unwrap();
        assert_eq!(store.get_release_task("a", "r").await.unwrap(), task("a", "r"));

        store.delete_release_task("a", "r").await.unwrap();
        assert!(store.get_release_task("a", "r").await.unwrap_err().is_not_found());
        // deleting twice is fine
        store.delete_release_task("a", "r").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_namespace_and_glob() {
        let store = ReleaseStore::in_memory();
        for (ns, name) in [("a", "zk-1"), ("a", "zk-2"), ("a", "kafka"), ("b", "zk-3")] {
            store.create_or_update_release_task(&task(ns, name)).await.unwrap();
        }
        // a namespace must not match another one sharing its prefix
        store.create_or_update_release_task(&task("ab", "zk-9")).await.unwrap();

        assert_eq!(store.get_release_tasks("a", "").await.unwrap().len(), 3);
        assert_eq!(store.get_release_tasks("a", "zk-*").await.unwrap().len(), 2);
        assert_eq!(store.get_release_tasks("", "zk-*").await.unwrap().len(), 4);
        assert_eq!(store.get_release_tasks("", "*").await.unwrap().len(), 5);
        assert!(store.get_release_tasks("a", "[").await.unwrap_err().is_invalid_argument());
    }

    #[tokio::test]
    async fn test_batched_lookups_skip_misses() {
        let store = ReleaseStore::in_memory();
        store.create_or_update_release_cache(&cache("a", "r1")).await.unwrap();
        store.create_or_update_release_task(&task("a", "r1")).await.unwrap();

        let configs: Vec<ReleaseConfig> = ["r1", "r2"]
            .iter()
            .map(|name| ReleaseConfig {
                name: name.to_string(),
                namespace: "a".to_string(),
                ..Default::default()
            })
            .collect();

        let caches = store.get_release_caches_by_release_configs(&configs).await.unwrap();
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].name(), "r1");
        let tasks = store.get_release_tasks_by_release_configs(&configs).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_backups() {
        let store = ReleaseStore::in_memory();
        let info = ReleaseInfoV2::placeholder("a", "gone");
        store.create_release_backup("a", "gone", &info).await.unwrap();

        assert_eq!(store.get_release_backup("a", "gone").await.unwrap(), info);
        assert_eq!(store.list_release_backups("a").await.unwrap().len(), 1);
        assert!(store.list_release_backups("b").await.unwrap().is_empty());

        store.delete_release_backup("a", "gone").await.unwrap();
        assert!(store.get_release_backup("a", "gone").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_project_tasks() {
        let store = ReleaseStore::in_memory();
        let task = ProjectTask {
            namespace: "a".into(),
            name: "p".into(),
            latest_task_sig: None,
            timeout_sec: 30,
        };
        store.create_or_update_project_task(&task).await.unwrap();
        assert_eq!(store.get_project_task("a", "p").await.unwrap(), task);
        assert_eq!(store.get_project_tasks("a", "p*").await.unwrap().len(), 1);
        // project pointers never show up as release pointers
        assert!(store.get_release_tasks("a", "").await.unwrap().is_empty());

        store.delete_project_task("a", "p").await.unwrap();
        assert!(store.get_project_task("a", "p").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_store_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set("cache:a:r", b"not json".to_vec()).await.unwrap();
        let store = ReleaseStore::new(backend);
        let err = store.get_release_cache("a", "r").await.unwrap_err();
        assert!(matches!(err, WalmError::Store(_)));
    }
}
