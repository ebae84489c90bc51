//! Manifest transformation pipeline
//!
//! Plugins rewrite the rendered object set before it reaches the cluster.
//! They run in declaration order and each one receives the full list the
//! previous one emitted. A release names its plugins with
//! [`ReleasePlugin`] entries; the [`PluginRegistry`] maps those names to
//! implementations.

mod builtin_selector;
mod custom_configmap;
mod custom_ingress;
mod health_probe;
mod isomate;
mod label_pod;
mod node_selector;
mod pause;
mod validate_release_config;

pub use builtin_selector::BuiltInSelector;
pub use custom_configmap::CustomConfigmap;
pub use custom_ingress::CustomIngress;
pub use health_probe::CustomHealthProbe;
pub use isomate::{IsomateName, IsomateSetConverter};
pub use label_pod::LabelPod;
pub use node_selector::NodeSelector;
pub use pause::PauseRelease;
pub use validate_release_config::ValidateReleaseConfig;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use walm_core::{K8sObject, ReleasePlugin};

use crate::cluster::ClusterClient;
use crate::error::{Result, WalmError};

/// Annotations and labels read or written by the standard plugins
pub mod annotations {
    pub const CUSTOM_CONFIGMAP: &str = "transwarp/walmplugin.custom.configmap";
    pub const CUSTOM_INGRESS: &str = "transwarp/walmplugin.custom.ingress";
    /// The apply layer leaves an existing object untouched on upgrade
    pub const UPGRADE_POLICY: &str = "transwarp/tos.upgrade.policy";
    pub const UPGRADE_POLICY_UPGRADE: &str = "Upgrade";
    pub const INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
    pub const USE_POD_OFFLINE: &str = "Transwarp_Walm_Use_Pod_Offline";
    pub const OFFLINE_ALL_ORDINALS: &str = "offline-pod.transwarp.io/all-ordinals";
    pub const NEED_ISOMATE_NAME: &str = "NeedIsomateName";
    pub const CONVERT_TO_ISOMATE_SET: &str = "ConvertToIsomateSet";
    pub const ISOMATE_NAME_LABEL: &str = "IsomateName";
    pub const ISOMATE_SET_NAME_LABEL: &str = "isomateset.transwarp.io/isomateset-name";
    pub const PLUGIN_HERITAGE: &str = "walmplugin";
}

/// What a plugin knows about the release it transforms
#[derive(Clone)]
pub struct PluginContext {
    pub release_name: String,
    pub namespace: String,
    pub cluster: Arc<dyn ClusterClient>,
}

impl PluginContext {
    pub fn new(release_name: &str, namespace: &str, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            release_name: release_name.to_string(),
            namespace: namespace.to_string(),
            cluster,
        }
    }
}

/// A named manifest transformer
#[async_trait]
pub trait ManifestPlugin: Send + Sync {
    /// Registry name, matched against [`ReleasePlugin::name`]
    fn name(&self) -> &'static str;

    async fn transform(
        &self,
        ctx: &PluginContext,
        args: &str,
        objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>>;
}

/// Decode plugin arguments; empty arguments give the defaults
pub(crate) fn parse_args<T: DeserializeOwned + Default>(args: &str) -> Result<T> {
    if args.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(args)
        .map_err(|e| WalmError::InvalidArgument(format!("invalid plugin args: {}", e)))
}

/// Name to implementation map
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn ManifestPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every standard plugin
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CustomConfigmap));
        registry.register(Arc::new(CustomIngress));
        registry.register(Arc::new(CustomHealthProbe));
        registry.register(Arc::new(LabelPod));
        registry.register(Arc::new(NodeSelector));
        registry.register(Arc::new(IsomateName));
        registry.register(Arc::new(IsomateSetConverter));
        registry.register(Arc::new(PauseRelease));
        registry.register(Arc::new(ValidateReleaseConfig));
        registry.register(Arc::new(BuiltInSelector));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn ManifestPlugin>) {
        self.plugins.insert(plugin.name(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ManifestPlugin>> {
        self.plugins.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Run the enabled entries of `plugins` in order
    ///
    /// The first failing plugin aborts the run. Unknown names fail even when
    /// the entry is disabled.
    pub async fn run_pipeline(
        &self,
        ctx: &PluginContext,
        plugins: &[ReleasePlugin],
        mut objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        for entry in plugins {
            let plugin = self.get(&entry.name).ok_or_else(|| WalmError::UnknownPlugin {
                name: entry.name.clone(),
            })?;
            if entry.disable {
                continue;
            }
            debug!(
                plugin = %entry.name,
                namespace = %ctx.namespace,
                release = %ctx.release_name,
                objects = objects.len(),
                "running plugin"
            );
            objects = plugin
                .transform(ctx, &entry.args, objects)
                .await
                .map_err(|e| WalmError::Plugin {
                    plugin: entry.name.clone(),
                    message: e.to_string(),
                })?;
        }
        Ok(objects)
    }
}

/// Workloads whose pod template plugins edit
pub(crate) fn workloads_mut(objects: &mut [K8sObject]) -> impl Iterator<Item = &mut K8sObject> {
    objects.iter_mut().filter(|o| o.is_workload())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use walm_core::kinds;
    use walm_core::plugin::names;

    #[tokio::test]
    async fn test_pipeline_runs_in_order() {
        let registry = PluginRegistry::with_defaults();
        let plugins = vec![
            ReleasePlugin::new(names::LABEL_POD).with_args(r#"{"labelsToAdd":{"tier":"db"}}"#),
            ReleasePlugin::new(names::PAUSE_RELEASE),
        ];
        let objects = vec![workload(kinds::STATEFUL_SET, "zk")];

        let out = registry
            .run_pipeline(&context("r"), &plugins, objects)
            .await
            .unwrap();
        assert_eq!(out[0].replicas(), Some(0));
        assert_eq!(
            out[0].get(&["spec", "template", "metadata", "labels", "tier"]).unwrap(),
            "db"
        );
    }

    #[tokio::test]
    async fn test_disabled_entries_are_skipped() {
        let registry = PluginRegistry::with_defaults();
        let plugins = vec![ReleasePlugin::new(names::PAUSE_RELEASE).disabled()];
        let mut sts = workload(kinds::STATEFUL_SET, "zk");
        sts.set_replicas(3);

        let out = registry
            .run_pipeline(&context("r"), &plugins, vec![sts])
            .await
            .unwrap();
        assert_eq!(out[0].replicas(), Some(3));
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_fatal() {
        let registry = PluginRegistry::with_defaults();
        let plugins = vec![ReleasePlugin::new("NoSuchPlugin").disabled()];
        let err = registry
            .run_pipeline(&context("r"), &plugins, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WalmError::UnknownPlugin { .. }));
    }

    #[tokio::test]
    async fn test_plugin_error_names_the_plugin() {
        let registry = PluginRegistry::with_defaults();
        let plugins = vec![ReleasePlugin::new(names::LABEL_POD).with_args("{not json")];
        let err = registry
            .run_pipeline(&context("r"), &plugins, Vec::new())
            .await
            .unwrap_err();
        match err {
            WalmError::Plugin { plugin, .. } => assert_eq!(plugin, names::LABEL_POD),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_defaults_cover_every_standard_name() {
        let registry = PluginRegistry::with_defaults();
        for name in [
            names::CUSTOM_CONFIGMAP,
            names::CUSTOM_INGRESS,
            names::CUSTOM_HEALTH_PROBE,
            names::LABEL_POD,
            names::NODE_SELECTOR,
            names::ISOMATE_NAME,
            names::ISOMATE_SET_CONVERTER,
            names::PAUSE_RELEASE,
            names::VALIDATE_RELEASE_CONFIG,
            names::BUILT_IN_SELECTOR,
        ] {
            assert!(registry.contains(name), "{name} is not registered");
        }
    }
}
