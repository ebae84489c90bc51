use async_trait::async_trait;
use serde::Deserialize;
use walm_core::plugin::names;
use walm_core::{K8sObject, kinds};

use super::{ManifestPlugin, PluginContext, parse_args, workloads_mut};
use crate::error::Result;

/// Workload names per kind
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeTargets {
    #[serde(default)]
    deployment: Vec<String>,
    #[serde(default)]
    stateful_set: Vec<String>,
    #[serde(default)]
    daemon_set: Vec<String>,
    #[serde(default)]
    job: Vec<String>,
}

impl ProbeTargets {
    fn contains(&self, object: &K8sObject) -> bool {
        let names = match object.kind() {
            kinds::DEPLOYMENT => &self.deployment,
            kinds::STATEFUL_SET => &self.stateful_set,
            kinds::DAEMON_SET => &self.daemon_set,
            kinds::JOB => &self.job,
            _ => return false,
        };
        names.iter().any(|n| n == object.name())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthProbeArgs {
    #[serde(default)]
    disable_liveness_probe: ProbeTargets,
    #[serde(default)]
    disable_readiness_probe: ProbeTargets,
    #[serde(default)]
    disable_all_liveness_probe: bool,
    #[serde(default)]
    disable_all_readiness_probe: bool,
}

/// Removes liveness and readiness probes from selected workloads
#[derive(Debug, Default, Clone, Copy)]
pub struct CustomHealthProbe;

#[async_trait]
impl ManifestPlugin for CustomHealthProbe {
    fn name(&self) -> &'static str {
        names::CUSTOM_HEALTH_PROBE
    }

    async fn transform(
        &self,
        _ctx: &PluginContext,
        args: &str,
        mut objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        let args: HealthProbeArgs = parse_args(args)?;
        for workload in workloads_mut(&mut objects) {
            let liveness =
                args.disable_all_liveness_probe || args.disable_liveness_probe.contains(workload);
            let readiness =
                args.disable_all_readiness_probe || args.disable_readiness_probe.contains(workload);
            if !liveness && !readiness {
                continue;
            }
            for container in workload.containers_mut() {
                if liveness {
                    container.remove("livenessProbe");
                }
                if readiness {
                    container.remove("readinessProbe");
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
    use serde_json::json;

    fn probed(kind: &str, name: &str) -> K8sObject {
        let mut object = workload(kind, name);
        object.set(
            &["spec", "template", "spec", "containers"],
            json!([
                {"name": "a", "livenessProbe": {"tcpSocket": {"port": 80}}, "readinessProbe": {"tcpSocket": {"port": 80}}},
                {"name": "b", "livenessProbe": {"tcpSocket": {"port": 81}}}
            ]),
        );
        object
    }

    #[tokio::test]
    async fn test_disable_listed_liveness() {
        let args = r#"{"disableLivenessProbe":{"statefulSet":["zk"]}}"#;
        let out = CustomHealthProbe
            .transform(
                &context("r"),
                args,
                vec![probed(kinds::STATEFUL_SET, "zk"), probed(kinds::DEPLOYMENT, "zk")],
            )
            .await
            .unwrap();

        let containers = out[0].get(&["spec", "template", "spec", "containers"]).unwrap();
        assert!(containers[0].get("livenessProbe").is_none());
        assert!(containers[0].get("readinessProbe").is_some());
        assert!(containers[1].get("livenessProbe").is_none());

        let untouched = out[1].get(&["spec", "template", "spec", "containers"]).unwrap();
        assert!(untouched[0].get("livenessProbe").is_some());
    }

    #[tokio::test]
    async fn test_disable_all_readiness() {
        let args = r#"{"disableAllReadinessProbe":true}"#;
        let out = CustomHealthProbe
            .transform(&context("r"), args, vec![probed(kinds::DEPLOYMENT, "web")])
            .await
            .unwrap();
        let containers = out[0].get(&["spec", "template", "spec", "containers"]).unwrap();
        assert!(containers[0].get("readinessProbe").is_none());
        assert!(containers[0].get("livenessProbe").is_some());
    }
}
