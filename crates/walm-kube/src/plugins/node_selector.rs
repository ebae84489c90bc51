use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    NodeSelectorRequirement, NodeSelectorTerm, PreferredSchedulingTerm, Toleration,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use walm_core::K8sObject;
use walm_core::plugin::names;

use super::{ManifestPlugin, PluginContext, parse_args, workloads_mut};
use crate::error::Result;

const NODE_AFFINITY: [&str; 5] = ["spec", "template", "spec", "affinity", "nodeAffinity"];
const REQUIRED: &str = "requiredDuringSchedulingIgnoredDuringExecution";
const PREFERRED: &str = "preferredDuringSchedulingIgnoredDuringExecution";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorTerm {
    #[serde(default)]
    match_expressions: Vec<NodeSelectorRequirement>,
    #[serde(default)]
    match_fields: Vec<NodeSelectorRequirement>,
}

impl SelectorTerm {
    fn into_term(self) -> NodeSelectorTerm {
        NodeSelectorTerm {
            match_expressions: (!self.match_expressions.is_empty()).then_some(self.match_expressions),
            match_fields: (!self.match_fields.is_empty()).then_some(self.match_fields),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeightedTerm {
    weight: i32,
    #[serde(default)]
    match_expressions: Vec<NodeSelectorRequirement>,
    #[serde(default)]
    match_fields: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeAffinityArgs {
    #[serde(default)]
    required_terms: Vec<SelectorTerm>,
    #[serde(default)]
    preferred_terms: Vec<WeightedTerm>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeSelectorArgs {
    #[serde(default)]
    node_affinity: NodeAffinityArgs,
    #[serde(default)]
    node_tolerations: Vec<Toleration>,
}

/// Appends node affinity terms and tolerations to every workload
///
/// Existing entries stay in place; nothing is de-duplicated.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeSelector;

#[async_trait]
impl ManifestPlugin for NodeSelector {
    fn name(&self) -> &'static str {
        names::NODE_SELECTOR
    }

    async fn transform(
        &self,
        _ctx: &PluginContext,
        args: &str,
        mut objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        let args: NodeSelectorArgs = parse_args(args)?;

        let required = args
            .node_affinity
            .required_terms
            .into_iter()
            .map(|t| serde_json::to_value(t.into_term()))
            .collect::<serde_json::Result<Vec<JsonValue>>>()?;
        let preferred = args
            .node_affinity
            .preferred_terms
            .into_iter()
            .map(|t| {
                serde_json::to_value(PreferredSchedulingTerm {
                    weight: t.weight,
                    preference: SelectorTerm {
                        match_expressions: t.match_expressions,
                        match_fields: t.match_fields,
                    }
                    .into_term(),
                })
            })
            .collect::<serde_json::Result<Vec<JsonValue>>>()?;
        let tolerations = args
            .node_tolerations
            .iter()
            .map(serde_json::to_value)
            .collect::<serde_json::Result<Vec<JsonValue>>>()?;

        for workload in workloads_mut(&mut objects) {
            if !required.is_empty() {
                let mut path = NODE_AFFINITY.to_vec();
                path.push(REQUIRED);
                workload
                    .ensure_array(&path, "nodeSelectorTerms")
                    .extend(required.iter().cloned());
            }
            if !preferred.is_empty() {
                workload
                    .ensure_array(&NODE_AFFINITY, PREFERRED)
                    .extend(preferred.iter().cloned());
            }
            if !tolerations.is_empty() {
                workload
                    .ensure_array(&["spec", "template", "spec"], "tolerations")
                    .extend(tolerations.iter().cloned());
            }
        }
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use serde_json::json;
    use walm_core::kinds;

    const ARGS: &str = r#"{
        "nodeAffinity": {
            "requiredTerms": [{"matchExpressions": [{"key": "zone", "operator": "In", "values": ["a"]}]}],
            "preferredTerms": [{"weight": 10, "matchExpressions": [{"key": "disk", "operator": "Exists"}]}]
        },
        "nodeTolerations": [{"key": "dedicated", "operator": "Equal", "value": "db", "effect": "NoSchedule"}]
    }"#;

    #[tokio::test]
    async fn test_terms_are_appended() {
        let mut sts = workload(kinds::STATEFUL_SET, "zk");
        sts.set(
            &["spec", "template", "spec", "tolerations"],
            json!([{"key": "existing", "operator": "Exists"}]),
        );

        let out = NodeSelector
            .transform(&context("r"), ARGS, vec![sts])
            .await
            .unwrap();
        let pod = out[0].get(&["spec", "template", "spec"]).unwrap();

        let terms = &pod["affinity"]["nodeAffinity"][REQUIRED]["nodeSelectorTerms"];
        assert_eq!(terms[0]["matchExpressions"][0]["key"], "zone");
        assert!(terms[0].get("matchFields").is_none());

        let preferred = &pod["affinity"]["nodeAffinity"][PREFERRED];
        assert_eq!(preferred[0]["weight"], 10);
        assert_eq!(preferred[0]["preference"]["matchExpressions"][0]["key"], "disk");

        let tolerations = pod["tolerations"].as_array().unwrap();
        assert_eq!(tolerations.len(), 2);
        assert_eq!(tolerations[0]["key"], "existing");
        assert_eq!(tolerations[1]["effect"], "NoSchedule");
    }

    #[tokio::test]
    async fn test_non_workloads_untouched() {
        let svc = K8sObject::new("v1", kinds::SERVICE, "zk");
        let out = NodeSelector
            .transform(&context("r"), ARGS, vec![svc.clone()])
            .await
            .unwrap();
        assert_eq!(out[0], svc);
    }
}
