use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use walm_core::K8sObject;
use walm_core::plugin::names;

use super::{ManifestPlugin, PluginContext, parse_args, workloads_mut};
use crate::error::Result;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelPodArgs {
    #[serde(default)]
    labels_to_add: BTreeMap<String, String>,
    #[serde(default)]
    annotations_to_add: BTreeMap<String, String>,
}

/// Adds labels and annotations to the pod template of every workload
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelPod;

#[async_trait]
impl ManifestPlugin for LabelPod {
    fn name(&self) -> &'static str {
        names::LABEL_POD
    }

    async fn transform(
        &self,
        _ctx: &PluginContext,
        args: &str,
        mut objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        let args: LabelPodArgs = parse_args(args)?;
        for workload in workloads_mut(&mut objects) {
            if !args.labels_to_add.is_empty() {
                let labels = workload.ensure_object(&["spec", "template", "metadata", "labels"]);
                for (k, v) in &args.labels_to_add {
                    labels.insert(k.clone(), JsonValue::from(v.as_str()));
                }
            }
            if !args.annotations_to_add.is_empty() {
                let annotations =
                    workload.ensure_object(&["spec", "template", "metadata", "annotations"]);
                for (k, v) in &args.annotations_to_add {
                    annotations.insert(k.clone(), JsonValue::from(v.as_str()));
                }
            }
        }
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use walm_core::kinds;

    #[tokio::test]
    async fn test_merges_into_existing_maps() {
        let mut deployment = workload(kinds::DEPLOYMENT, "web");
        deployment.set(
            &["spec", "template", "metadata", "labels"],
            serde_json::json!({"app": "web"}),
        );
        let cm = K8sObject::new("v1", kinds::CONFIG_MAP, "cfg");

        let out = LabelPod
            .transform(
                &context("r"),
                r#"{"labelsToAdd":{"team":"a"},"annotationsToAdd":{"scrape":"true"}}"#,
                vec![deployment, cm.clone()],
            )
            .await
            .unwrap();

        let labels = out[0].get(&["spec", "template", "metadata", "labels"]).unwrap();
        assert_eq!(labels["app"], "web");
        assert_eq!(labels["team"], "a");
        assert_eq!(
            out[0].get(&["spec", "template", "metadata", "annotations", "scrape"]).unwrap(),
            "true"
        );
        assert_eq!(out[1], cm);
    }

    #[tokio::test]
    async fn test_empty_args_leave_objects_alone() {
        let job = workload(kinds::JOB, "init");
        let out = LabelPod
            .transform(&context("r"), "", vec![job.clone()])
            .await
            .unwrap();
        assert_eq!(out, vec![job]);
    }
}
