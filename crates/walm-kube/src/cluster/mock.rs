//! In-memory cluster for tests
//!
//! Objects are stored by kind/namespace/name. Applying an object keeps the
//! `status` of the stored copy so tests can stage workload readiness. Two
//! kinds of failures can be injected: rejecting the apply of named objects,
//! and failing the next N calls with a connection reset.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use walm_core::{K8sObject, ReleaseConfig, ResourceMeta, kinds};

use super::{ClusterClient, LabelSelector, selector_matches};
use crate::error::{Result, WalmError};

type ObjectKey = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, K8sObject>,
    reject_apply: HashSet<(String, String)>,
    transient_failures: usize,
    counts: ClusterCounts,
    deleted: Vec<ResourceMeta>,
}

/// Calls served, for test assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClusterCounts {
    pub gets: usize,
    pub lists: usize,
    pub applies: usize,
    pub deletes: usize,
}

#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<RwLock<State>>,
}

fn key_of(kind: &str, namespace: &str, name: &str) -> ObjectKey {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as-is; it must carry its namespace
    pub async fn insert(&self, object: K8sObject) {
        let key = key_of(
            object.kind(),
            object.namespace().unwrap_or_default(),
            object.name(),
        );
        self.state.write().await.objects.insert(key, object);
    }

    pub async fn insert_release_config(&self, config: &ReleaseConfig) -> Result<()> {
        self.insert(config.to_object()?).await;
        Ok(())
    }

    pub async fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<K8sObject> {
        self.state
            .read()
            .await
            .objects
            .get(&key_of(kind, namespace, name))
            .cloned()
    }

    pub async fn objects_of_kind(&self, kind: &str, namespace: &str) -> Vec<K8sObject> {
        self.state
            .read()
            .await
            .objects
            .iter()
            .filter(|((k, ns, _), _)| k == kind && ns == namespace)
            .map(|(_, object)| object.clone())
            .collect()
    }

    /// Replace the `status` of a stored object
    pub async fn set_status(&self, kind: &str, namespace: &str, name: &str, status: JsonValue) -> Result<()> {
        let mut state = self.state.write().await;
        let object = state
            .objects
            .get_mut(&key_of(kind, namespace, name))
            .ok_or_else(|| WalmError::not_found(kind, namespace, name))?;
        object.set(&["status"], status);
        Ok(())
    }

    /// Add a pod with the given labels
    pub async fn add_pod(&self, namespace: &str, name: &str, labels: &[(&str, &str)]) {
        let mut pod = K8sObject::new("v1", kinds::POD, name);
        pod.set_namespace(namespace);
        for (k, v) in labels {
            pod.set_label(k, v);
        }
        self.insert(pod).await;
    }

    /// Make every later apply of `kind`/`name` fail
    pub async fn reject_apply(&self, kind: &str, name: &str) {
        self.state
            .write()
            .await
            .reject_apply
            .insert((kind.to_string(), name.to_string()));
    }

    pub async fn clear_rejections(&self) {
        self.state.write().await.reject_apply.clear();
    }

    /// Fail the next `count` calls with a connection reset
    pub async fn fail_next(&self, count: usize) {
        self.state.write().await.transient_failures = count;
    }

    pub async fn counts(&self) -> ClusterCounts {
        self.state.read().await.counts.clone()
    }

    /// Every delete served, in order
    pub async fn deleted(&self) -> Vec<ResourceMeta> {
        self.state.read().await.deleted.clone()
    }

    fn take_transient_failure(state: &mut State) -> Result<()> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(WalmError::TransientIo(
                "read tcp: connection reset by peer".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get_object(&self, resource: &ResourceMeta) -> Result<Option<K8sObject>> {
        let mut state = self.state.write().await;
        Self::take_transient_failure(&mut state)?;
        state.counts.gets += 1;
        Ok(state
            .objects
            .get(&key_of(&resource.kind, &resource.namespace, &resource.name))
            .cloned())
    }

    async fn list_objects(&self, kind: &str, namespace: &str, selector: &LabelSelector) -> Result<Vec<K8sObject>> {
        let mut state = self.state.write().await;
        Self::take_transient_failure(&mut state)?;
        state.counts.lists += 1;
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), object)| {
                k == kind && (namespace.is_empty() || ns == namespace) && selector_matches(selector, object)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn apply_object(&self, namespace: &str, object: &K8sObject) -> Result<()> {
        let mut state = self.state.write().await;
        Self::take_transient_failure(&mut state)?;
        state.counts.applies += 1;

        if state
            .reject_apply
            .contains(&(object.kind().to_string(), object.name().to_string()))
        {
            return Err(WalmError::InvalidArgument(format!(
                "admission webhook denied {} {}",
                object.kind(),
                object.name()
            )));
        }

        let mut object = object.clone();
        let target_namespace = object.namespace().unwrap_or(namespace).to_string();
        object.set_namespace(&target_namespace);
        let key = key_of(object.kind(), &target_namespace, object.name());

        if let Some(status) = state
            .objects
            .get(&key)
            .and_then(|existing| existing.get(&["status"]))
            .cloned()
        {
            object.set(&["status"], status);
        }
        state.objects.insert(key, object);
        Ok(())
    }

    async fn delete_object(&self, resource: &ResourceMeta) -> Result<()> {
        let mut state = self.state.write().await;
        Self::take_transient_failure(&mut state)?;
        state.counts.deletes += 1;
        state.deleted.push(resource.clone());
        state
            .objects
            .remove(&key_of(&resource.kind, &resource.namespace, &resource.name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(name: &str) -> K8sObject {
        let mut object = K8sObject::new("apps/v1", kinds::DEPLOYMENT, name);
        object.set_replicas(2);
        object
    }

    #[tokio::test]
    async fn test_apply_defaults_namespace_and_keeps_status() {
        let cluster = MockCluster::new();
        cluster.apply_object("a", &deployment("web")).await.unwrap();
        cluster
            .set_status(kinds::DEPLOYMENT, "a", "web", json!({"readyReplicas": 2}))
            .await
            .unwrap();

        let mut updated = deployment("web");
        updated.set_replicas(3);
        cluster.apply_object("a", &updated).await.unwrap();

        let stored = cluster.object(kinds::DEPLOYMENT, "a", "web").await.unwrap();
        assert_eq!(stored.replicas(), Some(3));
        assert_eq!(stored.namespace(), Some("a"));
        assert_eq!(stored.get(&["status", "readyReplicas"]).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rejected_apply() {
        let cluster = MockCluster::new();
        cluster.reject_apply(kinds::DEPLOYMENT, "web").await;
        assert!(cluster.apply_object("a", &deployment("web")).await.is_err());
        cluster.clear_rejections().await;
        assert!(cluster.apply_object("a", &deployment("web")).await.is_ok());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retryable() {
        let cluster = MockCluster::new();
        cluster.fail_next(1).await;
        let resource = ResourceMeta::new(kinds::POD, "a", "p");
        let err = cluster.get_object(&resource).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(cluster.get_object(&resource).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let cluster = MockCluster::new();
        cluster.add_pod("a", "zk-0", &[("app", "zk")]).await;
        cluster.add_pod("a", "zk-1", &[("app", "zk")]).await;
        cluster.add_pod("a", "web-0", &[("app", "web")]).await;
        cluster.add_pod("b", "zk-0", &[("app", "zk")]).await;

        let mut selector = LabelSelector::new();
        selector.insert("app".into(), "zk".into());
        assert_eq!(cluster.list_pods("a", &selector).await.unwrap().len(), 2);
        assert_eq!(cluster.list_pods("", &selector).await.unwrap().len(), 3);

        cluster.delete_pod("a", "zk-0").await.unwrap();
        cluster.delete_pod("a", "missing").await.unwrap();
        assert_eq!(cluster.list_pods("a", &selector).await.unwrap().len(), 1);
        assert_eq!(cluster.deleted().await.len(), 2);
        assert_eq!(cluster.counts().await.deletes, 2);
    }

    #[tokio::test]
    async fn test_release_config_lookup() {
        let cluster = MockCluster::new();
        let err = cluster.get_release_config("a", "r").await.unwrap_err();
        assert!(err.is_not_found());

        let mut config = ReleaseConfig {
            name: "r".into(),
            namespace: "a".into(),
            ..Default::default()
        };
        config.labels.insert("Project-Name".into(), "p".into());
        cluster.insert_release_config(&config).await.unwrap();

        assert_eq!(cluster.get_release_config("a", "r").await.unwrap(), config);
        let mut selector = LabelSelector::new();
        selector.insert("Project-Name".into(), "p".into());
        assert_eq!(cluster.list_release_configs("a", &selector).await.unwrap().len(), 1);
        assert!(cluster.get_dependency_meta("a", "r").await.unwrap().is_none());
    }
}
