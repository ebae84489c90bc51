//! Release readiness
//!
//! A release is ready when every workload and claim it owns is:
//! - Deployment / StatefulSet: `readyReplicas >= replicas`
//! - DaemonSet: `numberReady == desiredNumberScheduled`
//! - Job: at least one succeeded pod
//! - PersistentVolumeClaim: `Bound`
//!
//! Other kinds are ready as soon as they exist.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use walm_core::{K8sObject, MsgCode, ReleaseInfoV2, ResourceMeta, kinds};

use crate::cluster::ClusterClient;
use crate::error::Result;

/// Health of one object of a release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHealth {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub healthy: bool,
    pub ready: Option<i32>,
    pub desired: Option<i32>,
    pub message: Option<String>,
}

impl ResourceHealth {
    fn new(resource: &ResourceMeta) -> Self {
        Self {
            kind: resource.kind.clone(),
            name: resource.name.clone(),
            namespace: resource.namespace.clone(),
            healthy: true,
            ready: None,
            desired: None,
            message: None,
        }
    }

    fn replicas(mut self, ready: i32, desired: i32, healthy: bool) -> Self {
        self.ready = Some(ready);
        self.desired = Some(desired);
        self.healthy = healthy;
        if !healthy {
            self.message = Some(format!("{}/{} ready", ready, desired));
        }
        self
    }

    fn unhealthy(mut self, message: String) -> Self {
        self.healthy = false;
        self.message = Some(message);
        self
    }
}

/// Readiness of a whole release
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseStatus {
    pub resources: Vec<ResourceHealth>,
}

impl ReleaseStatus {
    pub fn is_ready(&self) -> bool {
        self.resources.iter().all(|r| r.healthy)
    }

    pub fn unhealthy_resources(&self) -> Vec<&ResourceHealth> {
        self.resources.iter().filter(|r| !r.healthy).collect()
    }

    pub fn summary(&self) -> String {
        self.unhealthy_resources()
            .iter()
            .map(|r| match &r.message {
                Some(message) => format!("{} {} is not ready: {}", r.kind, r.name, message),
                None => format!("{} {} is not ready", r.kind, r.name),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn typed<T: DeserializeOwned>(object: &K8sObject) -> Result<T> {
    Ok(serde_json::from_value(object.clone().into_value())?)
}

/// Health of one fetched object
pub fn object_health(resource: &ResourceMeta, object: &K8sObject) -> Result<ResourceHealth> {
    let health = ResourceHealth::new(resource);
    Ok(match object.kind() {
        kinds::DEPLOYMENT => {
            let deployment: Deployment = typed(object)?;
            let desired = deployment.spec.and_then(|s| s.replicas).unwrap_or(1);
            let ready = deployment
                .status
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            health.replicas(ready, desired, ready >= desired)
        }
        kinds::STATEFUL_SET => {
            let statefulset: StatefulSet = typed(object)?;
            let desired = statefulset.spec.and_then(|s| s.replicas).unwrap_or(1);
            let ready = statefulset
                .status
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            health.replicas(ready, desired, ready >= desired)
        }
        kinds::DAEMON_SET => {
            let daemonset: DaemonSet = typed(object)?;
            let (ready, desired) = daemonset
                .status
                .map(|s| (s.number_ready, s.desired_number_scheduled))
                .unwrap_or((0, 0));
            health.replicas(ready, desired, ready == desired)
        }
        kinds::JOB => {
            let job: Job = typed(object)?;
            let succeeded = job.status.and_then(|s| s.succeeded).unwrap_or(0);
            if succeeded >= 1 {
                health
            } else {
                health.unhealthy("job has not succeeded yet".to_string())
            }
        }
        kinds::PERSISTENT_VOLUME_CLAIM => {
            let pvc: PersistentVolumeClaim = typed(object)?;
            let phase = pvc.status.and_then(|s| s.phase).unwrap_or_default();
            if phase == "Bound" {
                health
            } else {
                health.unhealthy(format!("claim is {}", if phase.is_empty() { "Pending" } else { &phase }))
            }
        }
        _ => health,
    })
}

/// Fetch every resource of a release and check it
pub async fn release_status(cluster: &dyn ClusterClient, resources: &[ResourceMeta]) -> Result<ReleaseStatus> {
    let mut status = ReleaseStatus::default();
    for resource in resources {
        let health = match cluster.get_object(resource).await? {
            Some(object) => object_health(resource, &object)?,
            None => ResourceHealth::new(resource).unhealthy("not found".to_string()),
        };
        status.resources.push(health);
    }
    Ok(status)
}

/// Fill readiness, message and message code of a release info
pub fn apply_status(info: &mut ReleaseInfoV2, status: &ReleaseStatus) {
    info.ready = status.is_ready();
    if info.paused {
        info.message = "release is paused".to_string();
        info.msg_code = Some(MsgCode::Paused);
    } else if !info.ready {
        info.message = status.summary();
        info.msg_code = Some(MsgCode::NotReady);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use serde_json::json;

    async fn stage(cluster: &MockCluster, object: K8sObject, status: serde_json::Value) -> ResourceMeta {
        let resource = ResourceMeta::of(&object, "ns");
        cluster.apply_object("ns", &object).await.unwrap();
        cluster
            .set_status(&resource.kind, "ns", &resource.name, status)
            .await
            .unwrap();
        resource
    }

    fn workload(api_version: &str, kind: &str, name: &str, replicas: Option<i64>) -> K8sObject {
        let mut object = K8sObject::new(api_version, kind, name);
        object.set(&["spec", "selector"], json!({"matchLabels": {"app": name}}));
        object.set(&["spec", "template"], json!({"metadata": {"labels": {"app": name}}, "spec": {"containers": []}}));
        if let Some(replicas) = replicas {
            object.set_replicas(replicas);
        }
        object
    }

    #[tokio::test]
    async fn test_workload_readiness() {
        let cluster = MockCluster::new();
        let deploy = stage(
            &cluster,
            workload("apps/v1", kinds::DEPLOYMENT, "web", Some(2)),
            json!({"readyReplicas": 2}),
        )
        .await;
        let sts = stage(
            &cluster,
            workload("apps/v1", kinds::STATEFUL_SET, "zk", Some(3)),
            json!({"replicas": 3, "readyReplicas": 1}),
        )
        .await;
        let ds = stage(
            &cluster,
            workload("apps/v1", kinds::DAEMON_SET, "agent", None),
            json!({"numberReady": 4, "desiredNumberScheduled": 4, "currentNumberScheduled": 4, "numberMisscheduled": 0}),
        )
        .await;

        let status = release_status(&cluster, &[deploy, ds]).await.unwrap();
        assert!(status.is_ready());

        let status = release_status(&cluster, &[sts]).await.unwrap();
        assert!(!status.is_ready());
        assert_eq!(status.summary(), "StatefulSet zk is not ready: 1/3 ready");
    }

    #[tokio::test]
    async fn test_job_pvc_and_missing() {
        let cluster = MockCluster::new();
        let mut job = K8sObject::new("batch/v1", kinds::JOB, "init");
        job.set(&["spec", "template"], json!({"spec": {"containers": []}}));
        let job = stage(&cluster, job, json!({"succeeded": 1})).await;
        let pvc = stage(
            &cluster,
            K8sObject::new("v1", kinds::PERSISTENT_VOLUME_CLAIM, "data"),
            json!({"phase": "Pending"}),
        )
        .await;
        let missing = ResourceMeta::new(kinds::SERVICE, "ns", "gone");

        let status = release_status(&cluster, &[job.clone()]).await.unwrap();
        assert!(status.is_ready());

        let status = release_status(&cluster, &[job, pvc, missing]).await.unwrap();
        assert_eq!(status.unhealthy_resources().len(), 2);
    }

    #[test]
    fn test_apply_status_codes() {
        let not_ready = ReleaseStatus {
            resources: vec![ResourceHealth::new(&ResourceMeta::new(kinds::JOB, "ns", "j"))
                .unhealthy("job has not succeeded yet".into())],
        };

        let mut info = ReleaseInfoV2::placeholder("ns", "r");
        apply_status(&mut info, &not_ready);
        assert!(!info.ready);
        assert_eq!(info.msg_code, Some(MsgCode::NotReady));

        let mut paused = ReleaseInfoV2::placeholder("ns", "r");
        paused.paused = true;
        apply_status(&mut paused, &not_ready);
        assert_eq!(paused.msg_code, Some(MsgCode::Paused));

        let mut ready = ReleaseInfoV2::placeholder("ns", "r");
        apply_status(&mut ready, &ReleaseStatus::default());
        assert!(ready.ready);
        assert_eq!(ready.msg_code, None);
    }
}
