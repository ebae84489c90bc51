//! Resource planning over a dry-run render

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use walm_core::metainfo::{parse_cpu, parse_memory_mi, parse_storage_gi};
use walm_core::{ChartFile, K8sObject, ProjectParams, ReleaseRequest, kinds, parse_manifest};

use crate::error::Result;
use crate::project::ProjectManager;
use crate::release::ReleaseManager;

const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Per-pod totals over every container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodResources {
    pub cpu_request: f64,
    pub cpu_limit: f64,
    pub memory_request_mi: i64,
    pub memory_limit_mi: i64,
    pub gpu_request: i64,
    pub gpu_limit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRequest {
    pub name: String,
    #[serde(default)]
    pub storage_class: String,
    pub size_gi: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadResources {
    pub kind: String,
    pub name: String,
    pub replicas: i64,
    pub pod: PodResources,
    /// Claims per replica for StatefulSets, the claim itself for PVCs
    #[serde(default)]
    pub storage: Vec<StorageRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResources {
    pub name: String,
    pub workloads: Vec<WorkloadResources>,
}

fn count(value: &JsonValue) -> i64 {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .unwrap_or(0)
}

fn pod_resources(object: &K8sObject) -> PodResources {
    let mut totals = PodResources::default();
    let Some(containers) = object
        .get(&["spec", "template", "spec", "containers"])
        .and_then(JsonValue::as_array)
    else {
        return totals;
    };
    for container in containers {
        let resources = &container["resources"];
        let (requests, limits) = (&resources["requests"], &resources["limits"]);
        totals.cpu_request += parse_cpu(&requests["cpu"]).unwrap_or(0.0);
        totals.cpu_limit += parse_cpu(&limits["cpu"]).unwrap_or(0.0);
        totals.memory_request_mi += parse_memory_mi(&requests["memory"]).unwrap_or(0);
        totals.memory_limit_mi += parse_memory_mi(&limits["memory"]).unwrap_or(0);
        totals.gpu_request += count(&requests[GPU_RESOURCE]);
        totals.gpu_limit += count(&limits[GPU_RESOURCE]);
    }
    totals
}

fn storage_request(name: &str, spec: &JsonValue) -> StorageRequest {
    StorageRequest {
        name: name.to_string(),
        storage_class: spec["storageClassName"].as_str().unwrap_or_default().to_string(),
        size_gi: parse_storage_gi(&spec["resources"]["requests"]["storage"]).unwrap_or(0),
    }
}

fn workload_resources(object: &K8sObject) -> Option<WorkloadResources> {
    let replicas = match object.kind() {
        kinds::DEPLOYMENT | kinds::STATEFUL_SET => object.replicas().unwrap_or(1),
        kinds::DAEMON_SET => 1,
        kinds::JOB => object
            .get(&["spec", "parallelism"])
            .and_then(JsonValue::as_i64)
            .unwrap_or(1),
        kinds::PERSISTENT_VOLUME_CLAIM => {
            return Some(WorkloadResources {
                kind: object.kind().to_string(),
                name: object.name().to_string(),
                replicas: 1,
                pod: PodResources::default(),
                storage: vec![storage_request(
                    object.name(),
                    object.get(&["spec"]).unwrap_or(&JsonValue::Null),
                )],
            });
        }
        _ => return None,
    };

    let storage = object
        .get(&["spec", "volumeClaimTemplates"])
        .and_then(JsonValue::as_array)
        .map(|templates| {
            templates
                .iter()
                .map(|t| storage_request(t["metadata"]["name"].as_str().unwrap_or_default(), &t["spec"]))
                .collect()
        })
        .unwrap_or_default();

    Some(WorkloadResources {
        kind: object.kind().to_string(),
        name: object.name().to_string(),
        replicas,
        pod: pod_resources(object),
        storage,
    })
}

/// Flat list of workload and claim requirements of a set of objects
pub fn compute_resources(objects: &[K8sObject]) -> Vec<WorkloadResources> {
    objects.iter().filter_map(workload_resources).collect()
}

impl ReleaseManager {
    /// Resources an install or upgrade of `request` would ask for
    pub async fn compute_resources(
        &self,
        namespace: &str,
        request: ReleaseRequest,
        chart_files: Option<Vec<ChartFile>>,
    ) -> Result<Vec<WorkloadResources>> {
        let cache = self.dry_run_release(namespace, request, chart_files).await?;
        Ok(compute_resources(&parse_manifest(&cache.manifest)?))
    }
}

impl ProjectManager {
    /// Resources of every release a project batch would install
    pub async fn compute_resources(
        &self,
        namespace: &str,
        name: &str,
        params: ProjectParams,
    ) -> Result<Vec<ReleaseResources>> {
        let mut releases = Vec::new();
        for request in self.prepare_requests(name, params).await? {
            let release = request.name.clone();
            let workloads = self.releases().compute_resources(namespace, request, None).await?;
            releases.push(ReleaseResources {
                name: release,
                workloads,
            });
        }
        Ok(releases)
    }
}
