//! kube-rs implementation of [`ClusterClient`]
//!
//! Objects are handled as `DynamicObject`s resolved through API discovery
//! and written with server-side apply. Namespaced API handles are cached per
//! namespace in a bounded LRU; entries are created lazily and only evicted
//! on capacity.

use async_trait::async_trait;
use kube::Client;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PropagationPolicy};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use walm_core::{K8sObject, ResourceMeta};

use super::{ClusterClient, LabelSelector, selector_string};
use crate::error::{Result, WalmError};

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "walm";

type NamespaceApis = HashMap<String, Api<DynamicObject>>;

pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Discovery>,
    apis: Mutex<LruCache<String, NamespaceApis>>,
}

impl KubeCluster {
    /// Connect with the default kubeconfig / in-cluster configuration
    pub async fn try_default(cache_capacity: usize) -> Result<Self> {
        let client = Client::try_default().await?;
        Self::new(client, cache_capacity).await
    }

    pub async fn new(client: Client, cache_capacity: usize) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
            apis: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Re-run discovery, e.g. after a CRD was installed
    pub async fn refresh_discovery(&self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        *self.discovery.write().await = discovery;
        Ok(())
    }

    async fn lookup(&self, kind: &str, api_version: Option<&str>) -> Option<(ApiResource, ApiCapabilities)> {
        let discovery = self.discovery.read().await;
        match api_version {
            Some(api_version) => discovery.resolve_gvk(&gvk_of(api_version, kind)),
            None => discovery
                .groups()
                .find_map(|group| group.recommended_kind(kind)),
        }
    }

    /// Resolve a kind, refreshing discovery once on a miss
    async fn resolve(&self, kind: &str, api_version: Option<&str>) -> Result<Option<(ApiResource, ApiCapabilities)>> {
        if let Some(found) = self.lookup(kind, api_version).await {
            return Ok(Some(found));
        }
        debug!(kind = %kind, "kind not in discovery cache, refreshing");
        self.refresh_discovery().await?;
        Ok(self.lookup(kind, api_version).await)
    }

    async fn api_for(&self, resource: &ApiResource, capabilities: &ApiCapabilities, namespace: &str) -> Api<DynamicObject> {
        if capabilities.scope != Scope::Namespaced || namespace.is_empty() {
            return Api::all_with(self.client.clone(), resource);
        }
        let key = format!("{}/{}", resource.api_version, resource.plural);
        let mut cache = self.apis.lock().await;
        cache
            .get_or_insert_mut(namespace.to_string(), NamespaceApis::new)
            .entry(key)
            .or_insert_with(|| Api::namespaced_with(self.client.clone(), namespace, resource))
            .clone()
    }

    async fn api_for_kind(&self, kind: &str, namespace: &str) -> Result<Option<Api<DynamicObject>>> {
        match self.resolve(kind, None).await? {
            Some((resource, capabilities)) => Ok(Some(self.api_for(&resource, &capabilities, namespace).await)),
            None => Ok(None),
        }
    }
}

fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.rsplit_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    };
    GroupVersionKind::gvk(group, version, kind)
}

fn to_object(dynamic: DynamicObject) -> Result<K8sObject> {
    Ok(K8sObject::from_value(serde_json::to_value(dynamic)?)?)
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_object(&self, resource: &ResourceMeta) -> Result<Option<K8sObject>> {
        // a kind the server does not serve has no objects
        let Some(api) = self.api_for_kind(&resource.kind, &resource.namespace).await? else {
            return Ok(None);
        };
        match api.get_opt(&resource.name).await? {
            Some(dynamic) => Ok(Some(to_object(dynamic)?)),
            None => Ok(None),
        }
    }

    async fn list_objects(&self, kind: &str, namespace: &str, selector: &LabelSelector) -> Result<Vec<K8sObject>> {
        let Some(api) = self.api_for_kind(kind, namespace).await? else {
            return Ok(Vec::new());
        };
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector_string(selector));
        }
        api.list(&lp)
            .await?
            .items
            .into_iter()
            .map(to_object)
            .collect()
    }

    async fn apply_object(&self, namespace: &str, object: &K8sObject) -> Result<()> {
        let (resource, capabilities) = self
            .resolve(object.kind(), Some(object.api_version()))
            .await?
            .ok_or_else(|| {
                WalmError::InvalidArgument(format!(
                    "unknown resource type {}/{}",
                    object.api_version(),
                    object.kind()
                ))
            })?;

        let mut object = object.clone();
        let target_namespace = object.namespace().unwrap_or(namespace).to_string();
        if capabilities.scope == Scope::Namespaced {
            object.set_namespace(&target_namespace);
        }
        let dynamic: DynamicObject = serde_json::from_value(object.clone().into_value())?;

        let api = self.api_for(&resource, &capabilities, &target_namespace).await;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(object.name(), &params, &Patch::Apply(&dynamic))
            .await?;
        debug!(kind = %object.kind(), namespace = %target_namespace, name = %object.name(), "applied");
        Ok(())
    }

    async fn delete_object(&self, resource: &ResourceMeta) -> Result<()> {
        let Some(api) = self.api_for_kind(&resource.kind, &resource.namespace).await? else {
            return Ok(());
        };
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(&resource.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gvk_of() {
        let gvk = gvk_of("apps/v1", "Deployment");
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");

        let gvk = gvk_of("v1", "ConfigMap");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");

        let gvk = gvk_of("apiextensions.transwarp.io/v1beta1", "ReleaseConfig");
        assert_eq!(gvk.group, "apiextensions.transwarp.io");
    }

    #[test]
    fn test_field_manager_constant() {
        assert_eq!(FIELD_MANAGER, "walm");
    }
}
