use async_trait::async_trait;
use walm_core::plugin::names;
use walm_core::release::AUTO_GEN_LABEL;
use walm_core::{K8sObject, ReleaseConfig, kinds};

use super::{ManifestPlugin, PluginContext};
use crate::error::{Result, WalmError};

/// Leaves exactly one ReleaseConfig named after the release
///
/// ReleaseConfigs with another name are dropped. Of the rest, at most one
/// auto-generated (`auto-gen=true`) and one user-defined are allowed. When
/// both exist the auto-generated one survives and takes the user-defined
/// output config and labels. The survivor never carries `auto-gen`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidateReleaseConfig;

fn merge_user_config(auto_gen: &K8sObject, user: &K8sObject) -> Result<K8sObject> {
    let mut merged = ReleaseConfig::from_object(auto_gen)?;
    let user = ReleaseConfig::from_object(user)?;
    merged.spec.output_config = user.spec.output_config;
    merged.labels.extend(user.labels);
    Ok(merged.to_object()?)
}

#[async_trait]
impl ManifestPlugin for ValidateReleaseConfig {
    fn name(&self) -> &'static str {
        names::VALIDATE_RELEASE_CONFIG
    }

    async fn transform(
        &self,
        ctx: &PluginContext,
        _args: &str,
        objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        let mut kept = Vec::with_capacity(objects.len());
        let mut auto_gen = Vec::new();
        let mut user_defined = Vec::new();

        for object in objects {
            if !object.is_kind(kinds::RELEASE_CONFIG) {
                kept.push(object);
            } else if object.name() != ctx.release_name {
                continue;
            } else if object.label(AUTO_GEN_LABEL) == Some("true") {
                auto_gen.push(object);
            } else {
                user_defined.push(object);
            }
        }

        if auto_gen.len() > 1 || user_defined.len() > 1 {
            return Err(WalmError::InvalidArgument(format!(
                "release {}/{} renders {} auto-generated and {} user-defined ReleaseConfigs, at most one of each is allowed",
                ctx.namespace,
                ctx.release_name,
                auto_gen.len(),
                user_defined.len()
            )));
        }

        let mut release_config = match (auto_gen.pop(), user_defined.pop()) {
            (Some(auto_gen), Some(user)) => merge_user_config(&auto_gen, &user)?,
            (Some(auto_gen), None) => auto_gen,
            (None, Some(user)) => user,
            (None, None) => {
                return Err(WalmError::InvalidArgument(format!(
                    "release {}/{} renders no ReleaseConfig",
                    ctx.namespace, ctx.release_name
                )));
            }
        };
        release_config.remove_label(AUTO_GEN_LABEL);
        kept.push(release_config);
        Ok(kept)
    }
}
