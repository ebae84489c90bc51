use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;
use walm_core::plugin::names;
use walm_core::{K8sObject, kinds};

use super::annotations::{CUSTOM_CONFIGMAP, PLUGIN_HERITAGE, UPGRADE_POLICY, UPGRADE_POLICY_UPGRADE};
use super::{ManifestPlugin, PluginContext, parse_args, workloads_mut};
use crate::error::{Result, WalmError};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigmapItem {
    #[serde(default)]
    data: String,
    mount_path: String,
    sub_path: String,
    #[serde(default)]
    mode: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigmapToAdd {
    #[serde(default)]
    apply_all_resources: bool,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    resource_name: String,
    #[serde(default)]
    items: Vec<ConfigmapItem>,
}

impl ConfigmapToAdd {
    fn targets(&self, object: &K8sObject) -> bool {
        self.apply_all_resources || (object.kind() == self.kind && object.name() == self.resource_name)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomConfigmapArgs {
    #[serde(default)]
    configmap_to_add: BTreeMap<String, ConfigmapToAdd>,
    #[serde(default)]
    configmap_to_skip_names: Vec<String>,
    #[serde(default)]
    configmap_skip_all: bool,
}

/// Adds user ConfigMaps mounted into workloads and pins existing ones
///
/// Every `configmapToAdd` entry becomes a ConfigMap named
/// `walmplugin-<key>-<release>-cm`, mounted into the workloads it targets.
/// Release ConfigMaps listed for skipping are marked so the apply layer
/// leaves them untouched on upgrade.
#[derive(Debug, Default, Clone, Copy)]
pub struct CustomConfigmap;

fn configmap_name(key: &str, release: &str) -> String {
    format!("walmplugin-{}-{}-cm", key, release)
}

fn volume_name(key: &str) -> String {
    format!("walmplugin-{}-cm", key)
}

fn build_configmap(ctx: &PluginContext, key: &str, entry: &ConfigmapToAdd) -> K8sObject {
    let mut cm = K8sObject::new("v1", kinds::CONFIG_MAP, &configmap_name(key, &ctx.release_name));
    cm.set_namespace(&ctx.namespace);
    cm.set_label("release", &ctx.release_name);
    cm.set_label("heritage", PLUGIN_HERITAGE);
    cm.set_annotation(CUSTOM_CONFIGMAP, "true");

    let data: Map<String, JsonValue> = entry
        .items
        .iter()
        .map(|item| (item.sub_path.clone(), JsonValue::from(item.data.as_str())))
        .collect();
    cm.set(&["data"], JsonValue::Object(data));
    cm
}

fn mount_configmap(workload: &mut K8sObject, ctx: &PluginContext, key: &str, entry: &ConfigmapToAdd) {
    let items: Vec<JsonValue> = entry
        .items
        .iter()
        .map(|item| {
            let mut projection = json!({"key": item.sub_path, "path": item.sub_path});
            if let Some(mode) = item.mode {
                projection["mode"] = JsonValue::from(mode);
            }
            projection
        })
        .collect();
    workload
        .ensure_array(&["spec", "template", "spec"], "volumes")
        .push(json!({
            "name": volume_name(key),
            "configMap": {
                "name": configmap_name(key, &ctx.release_name),
                "items": items,
            }
        }));

    for container in workload.containers_mut() {
        let mounts = container
            .entry("volumeMounts")
            .or_insert_with(|| JsonValue::Array(Vec::new()));
        if let JsonValue::Array(mounts) = mounts {
            for item in &entry.items {
                mounts.push(json!({
                    "name": volume_name(key),
                    "mountPath": item.mount_path,
                    "subPath": item.sub_path,
                }));
            }
        }
    }
}

fn validate(args: &CustomConfigmapArgs) -> Result<()> {
    for (key, entry) in &args.configmap_to_add {
        if key.is_empty() {
            return Err(WalmError::InvalidArgument("configmap key is empty".to_string()));
        }
        if !entry.apply_all_resources && (entry.kind.is_empty() || entry.resource_name.is_empty()) {
            return Err(WalmError::InvalidArgument(format!(
                "configmap '{}' needs applyAllResources or a kind and resourceName",
                key
            )));
        }
        for item in &entry.items {
            if item.mount_path.is_empty() || item.sub_path.is_empty() {
                return Err(WalmError::InvalidArgument(format!(
                    "configmap '{}' has an item without mountPath or subPath",
                    key
                )));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ManifestPlugin for CustomConfigmap {
    fn name(&self) -> &'static str {
        names::CUSTOM_CONFIGMAP
    }

    async fn transform(
        &self,
        ctx: &PluginContext,
        args: &str,
        mut objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        let args: CustomConfigmapArgs = parse_args(args)?;
        validate(&args)?;

        for object in objects.iter_mut().filter(|o| o.is_kind(kinds::CONFIG_MAP)) {
            if object.has_flag_annotation(CUSTOM_CONFIGMAP) {
                continue;
            }
            if args.configmap_skip_all
                || args.configmap_to_skip_names.iter().any(|n| n == object.name())
            {
                object.set_annotation(UPGRADE_POLICY, UPGRADE_POLICY_UPGRADE);
            }
        }

        for (key, entry) in &args.configmap_to_add {
            for workload in workloads_mut(&mut objects) {
                if entry.targets(workload) {
                    mount_configmap(workload, ctx, key, entry);
                }
            }
        }
        for (key, entry) in &args.configmap_to_add {
            objects.push(build_configmap(ctx, key, entry));
        }
        Ok(objects)
    }
}
