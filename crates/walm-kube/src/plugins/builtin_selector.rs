use async_trait::async_trait;
use walm_core::K8sObject;
use walm_core::plugin::names;

use super::{ManifestPlugin, PluginContext};
use crate::error::Result;

/// Zone/os/arch selector hook; registered so charts naming it still install
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltInSelector;

#[async_trait]
impl ManifestPlugin for BuiltInSelector {
    fn name(&self) -> &'static str {
        names::BUILT_IN_SELECTOR
    }

    async fn transform(
        &self,
        _ctx: &PluginContext,
        _args: &str,
        objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        Ok(objects)
    }
}
