//! Isomate plugins
//!
//! An isomate is one variant of a multi-variant release. `IsomateName`
//! suffixes the objects that must be unique per variant, and
//! `IsomateSetConverter` turns opted-in StatefulSets into IsomateSets.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};
use walm_core::plugin::names;
use walm_core::{K8sObject, kinds};

use super::annotations::{
    CONVERT_TO_ISOMATE_SET, ISOMATE_NAME_LABEL, ISOMATE_SET_NAME_LABEL, NEED_ISOMATE_NAME,
};
use super::{ManifestPlugin, PluginContext, parse_args};
use crate::error::{Result, WalmError};

pub const ISOMATE_SET_API_VERSION: &str = "apiextensions.transwarp.io/v1alpha1";

#[derive(Debug, Default, Deserialize)]
struct IsomateNameArgs {
    #[serde(default)]
    name: String,
}

/// Renames objects annotated `NeedIsomateName=true` after the isomate
#[derive(Debug, Default, Clone, Copy)]
pub struct IsomateName;

#[async_trait]
impl ManifestPlugin for IsomateName {
    fn name(&self) -> &'static str {
        names::ISOMATE_NAME
    }

    async fn transform(
        &self,
        _ctx: &PluginContext,
        args: &str,
        mut objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        let args: IsomateNameArgs = parse_args(args)?;
        if args.name.is_empty() {
            return Err(WalmError::InvalidArgument("isomate name is empty".to_string()));
        }
        for object in objects
            .iter_mut()
            .filter(|o| o.has_flag_annotation(NEED_ISOMATE_NAME))
        {
            let renamed = format!("{}-{}", object.name(), args.name);
            object.set_name(&renamed);
            object.set_label(ISOMATE_NAME_LABEL, &args.name);
        }
        Ok(objects)
    }
}

/// Rewrites StatefulSets annotated `ConvertToIsomateSet=true` as IsomateSets
#[derive(Debug, Default, Clone, Copy)]
pub struct IsomateSetConverter;

/// Spec fields of a StatefulSet carried into its version template
const VERSION_FIELDS: [&str; 6] = [
    "replicas",
    "template",
    "volumeClaimTemplates",
    "serviceName",
    "podManagementPolicy",
    "updateStrategy",
];

fn convert(statefulset: &K8sObject) -> Result<K8sObject> {
    let name = statefulset.name().to_string();
    let mut isomate_set = K8sObject::new(ISOMATE_SET_API_VERSION, kinds::ISOMATE_SET, &name);

    let mut metadata = statefulset
        .get(&["metadata"])
        .and_then(JsonValue::as_object)
        .cloned()
        .unwrap_or_default();
    if let Some(JsonValue::Object(annotations)) = metadata.get_mut("annotations") {
        annotations.remove(CONVERT_TO_ISOMATE_SET);
    }
    isomate_set.set(&["metadata"], JsonValue::Object(metadata));

    let spec = statefulset
        .get(&["spec"])
        .and_then(JsonValue::as_object)
        .ok_or_else(|| {
            WalmError::InvalidArgument(format!("StatefulSet {} has no spec", name))
        })?;
    let mut version: Map<String, JsonValue> = VERSION_FIELDS
        .iter()
        .filter_map(|field| spec.get(*field).map(|v| (field.to_string(), v.clone())))
        .collect();
    if let Some(JsonValue::Object(template)) = version.get_mut("template") {
        let labels = template
            .entry("metadata")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .map(|m| m.entry("labels").or_insert_with(|| json!({})));
        if let Some(JsonValue::Object(labels)) = labels {
            labels.insert(ISOMATE_SET_NAME_LABEL.to_string(), JsonValue::from(name.as_str()));
        }
    }

    isomate_set.set(
        &["spec", "selector"],
        json!({ "matchLabels": { ISOMATE_SET_NAME_LABEL: name } }),
    );
    isomate_set.set(
        &["spec", "versionTemplates"],
        json!({ name.as_str(): JsonValue::Object(version) }),
    );
    Ok(isomate_set)
}

#[async_trait]
impl ManifestPlugin for IsomateSetConverter {
    fn name(&self) -> &'static str {
        names::ISOMATE_SET_CONVERTER
    }

    async fn transform(
        &self,
        _ctx: &PluginContext,
        _args: &str,
        objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        objects
            .into_iter()
            .map(|object| {
                if object.is_kind(kinds::STATEFUL_SET)
                    && object.has_flag_annotation(CONVERT_TO_ISOMATE_SET)
                {
                    convert(&object)
                } else {
                    Ok(object)
                }
            })
            .collect()
    }
}
