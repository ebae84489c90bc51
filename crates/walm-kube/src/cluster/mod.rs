//! Cluster collaborator
//!
//! [`ClusterClient`] is everything the release core reads from or writes to
//! the cluster, expressed over generic [`K8sObject`]s. [`KubeCluster`] talks
//! to a real API server; [`MockCluster`] keeps objects in memory for tests.

mod live;
mod mock;

pub use live::{FIELD_MANAGER, KubeCluster};
pub use mock::{ClusterCounts, MockCluster};

use async_trait::async_trait;
use std::collections::BTreeMap;
use walm_core::{DependencyMeta, K8sObject, ReleaseConfig, ResourceMeta, kinds};

use crate::error::{Result, WalmError};

/// Equality-based label selector
pub type LabelSelector = BTreeMap<String, String>;

/// Legacy instance kind carrying a release's dependency meta in its status
pub const INSTANCE_KIND: &str = "ApplicationInstance";
pub const INSTANCE_API_VERSION: &str = "apiextensions.transwarp.io/v1beta1";

/// Annotation of the legacy dummy service holding a JSON dependency meta
pub const DUMMY_SERVICE_META_ANNOTATION: &str = "transwarp.meta";
/// Label selecting the dummy service of a legacy release
pub const DUMMY_SERVICE_INSTALL_LABEL: &str = "transwarp.install";
pub const DUMMY_SERVICE_FLAG_LABEL: &str = "transwarp.meta";

/// `k=v,k=v` form of a selector
pub fn selector_string(selector: &LabelSelector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// True when every selector entry is a label of `object`
pub fn selector_matches(selector: &LabelSelector, object: &K8sObject) -> bool {
    selector
        .iter()
        .all(|(k, v)| object.label(k).is_some_and(|label| label == v))
}

/// Dependency meta stored on a legacy instance object
pub fn dependency_meta_of_instance(object: &K8sObject) -> Result<Option<DependencyMeta>> {
    match object.get(&["status", "dependencyMeta"]) {
        Some(meta) if !meta.is_null() => Ok(Some(serde_json::from_value(meta.clone())?)),
        _ => Ok(None),
    }
}

/// Dependency meta stored on a legacy dummy service
pub fn dependency_meta_of_service(object: &K8sObject) -> Result<Option<DependencyMeta>> {
    match object.annotation(DUMMY_SERVICE_META_ANNOTATION) {
        Some(meta) if !meta.is_empty() => Ok(Some(serde_json::from_str(meta)?)),
        _ => Ok(None),
    }
}

/// Cluster operations the release core needs
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Object by kind/namespace/name; `None` when it does not exist
    async fn get_object(&self, resource: &ResourceMeta) -> Result<Option<K8sObject>>;

    async fn list_objects(
        &self,
        kind: &str,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<K8sObject>>;

    /// Create or update one object; objects without a namespace land in `namespace`
    async fn apply_object(&self, namespace: &str, object: &K8sObject) -> Result<()>;

    /// Delete one object; a missing object is not an error
    async fn delete_object(&self, resource: &ResourceMeta) -> Result<()>;

    async fn get_release_config(&self, namespace: &str, name: &str) -> Result<ReleaseConfig> {
        let resource = ResourceMeta::new(kinds::RELEASE_CONFIG, namespace, name);
        match self.get_object(&resource).await? {
            Some(object) => Ok(ReleaseConfig::from_object(&object)?),
            None => Err(WalmError::not_found(kinds::RELEASE_CONFIG, namespace, name)),
        }
    }

    /// ReleaseConfigs of `namespace` matching `selector`
    async fn list_release_configs(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ReleaseConfig>> {
        self.list_objects(kinds::RELEASE_CONFIG, namespace, selector)
            .await?
            .iter()
            .map(|object| ReleaseConfig::from_object(object).map_err(WalmError::from))
            .collect()
    }

    /// Legacy dependency meta of a release, from its instance object or its
    /// dummy service
    async fn get_dependency_meta(&self, namespace: &str, name: &str) -> Result<Option<DependencyMeta>> {
        let instance = ResourceMeta::new(INSTANCE_KIND, namespace, name);
        if let Some(object) = self.get_object(&instance).await? {
            if let Some(meta) = dependency_meta_of_instance(&object)? {
                return Ok(Some(meta));
            }
        }

        let mut selector = LabelSelector::new();
        selector.insert(DUMMY_SERVICE_INSTALL_LABEL.to_string(), name.to_string());
        selector.insert(DUMMY_SERVICE_FLAG_LABEL.to_string(), "true".to_string());
        for service in self.list_objects(kinds::SERVICE, namespace, &selector).await? {
            if let Some(meta) = dependency_meta_of_service(&service)? {
                return Ok(Some(meta));
            }
        }
        Ok(None)
    }

    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<K8sObject>> {
        self.list_objects(kinds::POD, namespace, selector).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_object(&ResourceMeta::new(kinds::POD, namespace, name))
            .await
    }

    async fn list_pvcs(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<K8sObject>> {
        self.list_objects(kinds::PERSISTENT_VOLUME_CLAIM, namespace, selector)
            .await
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_object(&ResourceMeta::new(
            kinds::PERSISTENT_VOLUME_CLAIM,
            namespace,
            name,
        ))
        .await
    }
}
