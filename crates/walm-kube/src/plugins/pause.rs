use async_trait::async_trait;
use walm_core::plugin::names;
use walm_core::{K8sObject, kinds};

use super::annotations::{OFFLINE_ALL_ORDINALS, USE_POD_OFFLINE};
use super::{ManifestPlugin, PluginContext};
use crate::error::Result;

/// Scales the release's Deployments and StatefulSets to zero
///
/// StatefulSets that opt into pod offlining are taken offline through
/// their ordinals annotation instead. Recovery is a plain re-apply without
/// this plugin.
#[derive(Debug, Default, Clone, Copy)]
pub struct PauseRelease;

#[async_trait]
impl ManifestPlugin for PauseRelease {
    fn name(&self) -> &'static str {
        names::PAUSE_RELEASE
    }

    async fn transform(
        &self,
        _ctx: &PluginContext,
        _args: &str,
        mut objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        for object in objects.iter_mut() {
            match object.kind() {
                kinds::STATEFUL_SET if object.has_flag_annotation(USE_POD_OFFLINE) => {
                    object.set_annotation(OFFLINE_ALL_ORDINALS, "");
                }
                kinds::STATEFUL_SET | kinds::DEPLOYMENT => object.set_replicas(0),
                _ => {}
            }
        }
        Ok(objects)
    }
}
