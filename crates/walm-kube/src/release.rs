//! Release engine
//!
//! Every mutation of a release runs as a task on the [`TaskRunner`]. The
//! store keeps one [`ReleaseTask`] per release pointing at the latest task;
//! a submit is accepted only when that task is terminal (or gone), otherwise
//! the caller gets a [`WalmError::TaskInFlight`] and is expected to retry.

use futures::future::join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use walm_core::{
    ChartFile, K8sObject, MsgCode, ReleaseCache, ReleaseInfoV2, ReleaseRequest, ReleaseTask,
    ResourceMeta, TaskSig, kinds,
};
use walm_core::release::PROJECT_NAME_LABEL;

use crate::apply::ReleaseApplier;
use crate::cluster::{ClusterClient, LabelSelector};
use crate::config::WalmConfig;
use crate::error::{Result, WalmError};
use crate::plugins::annotations::ISOMATE_NAME_LABEL;
use crate::processor::{ChartProcessor, ProcessOptions};
use crate::resolver::DEFAULT_STRICT;
use crate::status::{apply_status, release_status};
use crate::store::ReleaseStore;
use crate::task::{TaskRunner, TaskState, handler_fn};

pub const CREATE_RELEASE_TASK: &str = "Create-Release-Task";
pub const DELETE_RELEASE_TASK: &str = "Delete-Release-Task";
pub const PAUSE_OR_RECOVER_RELEASE_TASK: &str = "Pause-Or-Recover-Release-Task";
pub const UPGRADE_RELEASE_TASK: &str = "Upgrade-Release-Task";

/// Label selecting the pods of a release
pub const RELEASE_LABEL: &str = "release";

/// Replicas a workload had before a chart-free pause
pub const ORIGIN_REPLICAS_ANNOTATION: &str = "walm.transwarp.io/origin-replicas";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReleaseTaskArgs {
    pub namespace: String,
    pub release_request: ReleaseRequest,
    #[serde(default)]
    pub chart_files: Option<Vec<ChartFile>>,
    #[serde(default)]
    pub paused: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReleaseTaskArgs {
    pub namespace: String,
    pub release_name: String,
    #[serde(default)]
    pub delete_pvcs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseOrRecoverReleaseTaskArgs {
    pub old_release_info: ReleaseInfoV2,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeReleaseTaskArgs {
    pub namespace: String,
    pub project_name: String,
    pub release_params: ReleaseRequest,
}

/// How a submit waits for its task
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitMode {
    /// Return right after submitting
    pub async_mode: bool,
    /// Wait budget in seconds; 0 uses the configured default
    pub timeout_sec: u64,
}

impl SubmitMode {
    pub fn sync(timeout_sec: u64) -> Self {
        Self {
            async_mode: false,
            timeout_sec,
        }
    }

    pub fn background() -> Self {
        Self {
            async_mode: true,
            timeout_sec: 0,
        }
    }
}

/// Message code of a failed task
pub fn failed_msg_code(task_name: &str, release_exists: bool) -> MsgCode {
    match task_name {
        CREATE_RELEASE_TASK | UPGRADE_RELEASE_TASK if release_exists => MsgCode::UpgradeFailed,
        CREATE_RELEASE_TASK | UPGRADE_RELEASE_TASK => MsgCode::InstallFailed,
        DELETE_RELEASE_TASK => MsgCode::DeleteFailed,
        PAUSE_OR_RECOVER_RELEASE_TASK => MsgCode::PauseOrRecoverFailed,
        _ => MsgCode::Failed,
    }
}

fn from_args<T: serde::de::DeserializeOwned>(task: &str, args: JsonValue) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| WalmError::TaskRunner(format!("invalid arguments for task {}: {}", task, e)))
}

struct Inner {
    store: ReleaseStore,
    cluster: Arc<dyn ClusterClient>,
    runner: Arc<dyn TaskRunner>,
    processor: ChartProcessor,
    applier: Arc<dyn ReleaseApplier>,
    config: WalmConfig,
}

/// Release lifecycle entry point
#[derive(Clone)]
pub struct ReleaseManager {
    inner: Arc<Inner>,
}

impl ReleaseManager {
    pub fn new(
        store: ReleaseStore,
        cluster: Arc<dyn ClusterClient>,
        runner: Arc<dyn TaskRunner>,
        processor: ChartProcessor,
        applier: Arc<dyn ReleaseApplier>,
        config: WalmConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cluster,
                runner,
                processor,
                applier,
                config,
            }),
        }
    }

    pub fn store(&self) -> &ReleaseStore {
        &self.inner.store
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterClient> {
        &self.inner.cluster
    }

    pub fn runner(&self) -> &Arc<dyn TaskRunner> {
        &self.inner.runner
    }

    pub fn processor(&self) -> &ChartProcessor {
        &self.inner.processor
    }

    pub fn config(&self) -> &WalmConfig {
        &self.inner.config
    }

    /// Register the release task handlers on the runner
    pub async fn register_tasks(&self) {
        let runner = self.inner.runner.clone();

        let manager = self.clone();
        runner
            .register(
                CREATE_RELEASE_TASK,
                handler_fn(move |args| {
                    let manager = manager.clone();
                    async move { manager.run_create_task(from_args(CREATE_RELEASE_TASK, args)?).await }
                }),
            )
            .await;

        let manager = self.clone();
        runner
            .register(
                DELETE_RELEASE_TASK,
                handler_fn(move |args| {
                    let manager = manager.clone();
                    async move { manager.run_delete_task(from_args(DELETE_RELEASE_TASK, args)?).await }
                }),
            )
            .await;

        let manager = self.clone();
        runner
            .register(
                PAUSE_OR_RECOVER_RELEASE_TASK,
                handler_fn(move |args| {
                    let manager = manager.clone();
                    async move {
                        manager
                            .run_pause_or_recover_task(from_args(PAUSE_OR_RECOVER_RELEASE_TASK, args)?)
                            .await
                    }
                }),
            )
            .await;

        let manager = self.clone();
        runner
            .register(
                UPGRADE_RELEASE_TASK,
                handler_fn(move |args| {
                    let manager = manager.clone();
                    async move { manager.run_upgrade_task(from_args(UPGRADE_RELEASE_TASK, args)?).await }
                }),
            )
            .await;
    }

    // ============ Task submission ============

    async fn latest_sig(&self, namespace: &str, name: &str) -> Result<Option<TaskSig>> {
        match self.inner.store.get_release_task(namespace, name).await {
            Ok(task) => Ok(task.latest_task_sig),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// State of a sig; a sig the runner no longer knows counts as finished
    async fn sig_state(&self, sig: &TaskSig) -> Result<Option<TaskState>> {
        match self.inner.runner.state(sig).await {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn timeout_sec(&self, requested: u64) -> u64 {
        if requested > 0 {
            requested
        } else {
            self.inner.config.task.default_timeout.as_secs()
        }
    }

    async fn submit_release_task(
        &self,
        namespace: &str,
        name: &str,
        task_name: &str,
        args: JsonValue,
        mode: SubmitMode,
    ) -> Result<()> {
        let previous = self.latest_sig(namespace, name).await?;
        if let Some(sig) = &previous {
            if let Some(state) = self.sig_state(sig).await? {
                if !state.is_terminal() {
                    return Err(WalmError::TaskInFlight {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        task: format!("{}-{}", sig.name, sig.uuid),
                    });
                }
            }
        }

        let timeout_sec = self.timeout_sec(mode.timeout_sec);
        let sig = self.inner.runner.submit(task_name, args, timeout_sec).await?;
        self.inner
            .store
            .create_or_update_release_task(&ReleaseTask {
                namespace: namespace.to_string(),
                name: name.to_string(),
                latest_task_sig: Some(sig.clone()),
            })
            .await?;
        info!(namespace = %namespace, release = %name, task = %task_name, uuid = %sig.uuid, "release task submitted");

        if let Some(old) = previous {
            if let Err(e) = self.inner.runner.purge(&old).await {
                debug!(namespace = %namespace, release = %name, uuid = %old.uuid, error = %e, "failed to purge previous task state");
            }
        }

        if mode.async_mode {
            return Ok(());
        }
        let state = self
            .inner
            .runner
            .wait(&sig, Duration::from_secs(timeout_sec))
            .await?;
        match state {
            TaskState::Timeout => Err(WalmError::Timeout(format!(
                "{}s running task {} of release {}/{}",
                timeout_sec, task_name, namespace, name
            ))),
            TaskState::Failure(message) => Err(WalmError::TaskRunner(format!(
                "task {} of release {}/{} failed: {}",
                task_name, namespace, name, message
            ))),
            _ => {
                info!(namespace = %namespace, release = %name, task = %task_name, "release task finished");
                Ok(())
            }
        }
    }

    /// Retry `op` while it fails with a retryable error
    async fn with_retry<T, F, Fut>(&self, operation: &str, namespace: &str, name: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.inner.config.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        namespace = %namespace,
                        release = %name,
                        operation = %operation,
                        attempt,
                        error = %e,
                        "retrying release operation"
                    );
                    tokio::time::sleep(self.inner.config.retry.interval).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    // ============ Install / upgrade ============

    /// Install or upgrade a release; upgrades reuse the previous request
    pub async fn install_upgrade_release(
        &self,
        namespace: &str,
        request: ReleaseRequest,
        chart_files: Option<Vec<ChartFile>>,
        paused: Option<bool>,
        mode: SubmitMode,
    ) -> Result<()> {
        let exists = self.latest_sig(namespace, &request.name).await?.is_some();
        request.validate(chart_files.is_some() || exists)?;
        let name = request.name.clone();
        let args = serde_json::to_value(CreateReleaseTaskArgs {
            namespace: namespace.to_string(),
            release_request: request,
            chart_files,
            paused,
        })?;
        self.submit_release_task(namespace, &name, CREATE_RELEASE_TASK, args, mode)
            .await
    }

    pub async fn install_upgrade_release_with_retry(
        &self,
        namespace: &str,
        request: ReleaseRequest,
        chart_files: Option<Vec<ChartFile>>,
        paused: Option<bool>,
        mode: SubmitMode,
    ) -> Result<()> {
        let name = request.name.clone();
        self.with_retry("install", namespace, &name, || {
            self.install_upgrade_release(namespace, request.clone(), chart_files.clone(), paused, mode)
        })
        .await
    }

    /// Upgrade a project member; the project label is injected by the task
    pub async fn upgrade_release_in_project(
        &self,
        namespace: &str,
        project_name: &str,
        request: ReleaseRequest,
        mode: SubmitMode,
    ) -> Result<()> {
        request.validate(true)?;
        let name = request.name.clone();
        let args = serde_json::to_value(UpgradeReleaseTaskArgs {
            namespace: namespace.to_string(),
            project_name: project_name.to_string(),
            release_params: request,
        })?;
        self.submit_release_task(namespace, &name, UPGRADE_RELEASE_TASK, args, mode)
            .await
    }

    pub async fn upgrade_release_in_project_with_retry(
        &self,
        namespace: &str,
        project_name: &str,
        request: ReleaseRequest,
        mode: SubmitMode,
    ) -> Result<()> {
        let name = request.name.clone();
        self.with_retry("upgrade", namespace, &name, || {
            self.upgrade_release_in_project(namespace, project_name, request.clone(), mode)
        })
        .await
    }

    /// Render and run the plugins without touching the cluster or the store
    pub async fn dry_run_release(
        &self,
        namespace: &str,
        request: ReleaseRequest,
        chart_files: Option<Vec<ChartFile>>,
    ) -> Result<ReleaseCache> {
        let old = self.cached(namespace, &request.name).await?;
        let options = ProcessOptions {
            chart_files,
            update: old.is_some(),
            old_release: old,
            dry_run: true,
            strict: DEFAULT_STRICT,
            ..Default::default()
        };
        self.inner.processor.process(namespace, request, options).await
    }

    async fn cached(&self, namespace: &str, name: &str) -> Result<Option<ReleaseCache>> {
        match self.inner.store.get_release_cache(namespace, name).await {
            Ok(cache) => Ok(Some(cache)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run_create_task(&self, args: CreateReleaseTaskArgs) -> Result<()> {
        let old = self.cached(&args.namespace, &args.release_request.name).await?;
        let options = ProcessOptions {
            chart_files: args.chart_files,
            update: old.is_some(),
            old_release: old,
            paused: args.paused,
            dry_run: false,
            strict: DEFAULT_STRICT,
        };
        self.inner
            .processor
            .process(&args.namespace, args.release_request, options)
            .await?;
        Ok(())
    }

    async fn run_upgrade_task(&self, args: UpgradeReleaseTaskArgs) -> Result<()> {
        let mut request = args.release_params;
        request
            .release_labels
            .insert(PROJECT_NAME_LABEL.to_string(), args.project_name);
        self.run_create_task(CreateReleaseTaskArgs {
            namespace: args.namespace,
            release_request: request,
            chart_files: None,
            paused: None,
        })
        .await
    }

    // ============ Delete ============

    pub async fn delete_release(
        &self,
        namespace: &str,
        name: &str,
        delete_pvcs: bool,
        mode: SubmitMode,
    ) -> Result<()> {
        if self.latest_sig(namespace, name).await?.is_none() && self.cached(namespace, name).await?.is_none() {
            info!(namespace = %namespace, release = %name, "release does not exist, nothing to delete");
            return Ok(());
        }
        let args = serde_json::to_value(DeleteReleaseTaskArgs {
            namespace: namespace.to_string(),
            release_name: name.to_string(),
            delete_pvcs,
        })?;
        self.submit_release_task(namespace, name, DELETE_RELEASE_TASK, args, mode)
            .await
    }

    pub async fn delete_release_with_retry(
        &self,
        namespace: &str,
        name: &str,
        delete_pvcs: bool,
        mode: SubmitMode,
    ) -> Result<()> {
        self.with_retry("delete", namespace, name, || {
            self.delete_release(namespace, name, delete_pvcs, mode)
        })
        .await
    }

    async fn run_delete_task(&self, args: DeleteReleaseTaskArgs) -> Result<()> {
        let (namespace, name) = (args.namespace.as_str(), args.release_name.as_str());
        if let Some(cache) = self.cached(namespace, name).await? {
            let pvc_selectors = if args.delete_pvcs {
                self.pvc_selectors(&cache).await?
            } else {
                Vec::new()
            };

            let mut backup = ReleaseInfoV2::from_cache(&cache);
            backup.output_config = self.output_config(namespace, name).await?;
            self.inner
                .store
                .create_release_backup(namespace, name, &backup)
                .await?;

            self.inner.applier.delete(namespace, name, &cache.manifest).await?;

            for selector in pvc_selectors {
                for pvc in self.inner.cluster.list_pvcs(namespace, &selector).await? {
                    info!(namespace = %namespace, release = %name, pvc = %pvc.name(), "deleting release pvc");
                    self.inner.cluster.delete_pvc(namespace, pvc.name()).await?;
                }
            }
            self.inner.store.delete_release_cache(namespace, name).await?;
        }
        self.inner.store.delete_release_task(namespace, name).await?;
        info!(namespace = %namespace, release = %name, "release deleted");
        Ok(())
    }

    /// Pod selectors of the StatefulSets and IsomateSets of a release
    async fn pvc_selectors(&self, cache: &ReleaseCache) -> Result<Vec<LabelSelector>> {
        let mut selectors = Vec::new();
        for resource in cache
            .resources
            .iter()
            .filter(|r| r.kind == kinds::STATEFUL_SET || r.kind == kinds::ISOMATE_SET)
        {
            let Some(object) = self.inner.cluster.get_object(resource).await? else {
                continue;
            };
            let labels: Option<LabelSelector> = object
                .get(&["spec", "selector", "matchLabels"])
                .map(|labels| serde_json::from_value(labels.clone()))
                .transpose()?;
            if let Some(labels) = labels.filter(|l| !l.is_empty()) {
                selectors.push(labels);
            }
        }
        Ok(selectors)
    }

    // ============ Pause / recover ============

    /// Toggle the pause plugin; a release already in the wanted state is left alone
    pub async fn pause_or_recover_release(
        &self,
        namespace: &str,
        name: &str,
        paused: bool,
        mode: SubmitMode,
    ) -> Result<()> {
        let info = self.get_release(namespace, name).await?;
        if info.paused == paused {
            warn!(namespace = %namespace, release = %name, paused, "release is already in the requested pause state");
            return Ok(());
        }
        let args = serde_json::to_value(PauseOrRecoverReleaseTaskArgs {
            old_release_info: info,
            paused,
        })?;
        self.submit_release_task(namespace, name, PAUSE_OR_RECOVER_RELEASE_TASK, args, mode)
            .await
    }

    async fn run_pause_or_recover_task(&self, args: PauseOrRecoverReleaseTaskArgs) -> Result<()> {
        let spec = &args.old_release_info.spec;
        let old = self.cached(&spec.namespace, &spec.name).await?;
        let options = ProcessOptions {
            chart_files: old.as_ref().and_then(|o| o.chart_files.clone()),
            update: old.is_some(),
            old_release: old,
            paused: Some(args.paused),
            dry_run: false,
            strict: DEFAULT_STRICT,
        };
        self.inner
            .processor
            .process(&spec.namespace, spec.to_request(), options)
            .await?;
        Ok(())
    }

    async fn release_workloads(&self, namespace: &str, name: &str) -> Result<Vec<K8sObject>> {
        let cache = self.inner.store.get_release_cache(namespace, name).await?;
        let mut workloads = Vec::new();
        for resource in cache
            .resources
            .iter()
            .filter(|r| r.kind == kinds::DEPLOYMENT || r.kind == kinds::STATEFUL_SET)
        {
            if let Some(object) = self.inner.cluster.get_object(resource).await? {
                workloads.push(object);
            }
        }
        Ok(workloads)
    }

    /// Scale workloads to zero without re-rendering, remembering their replicas
    pub async fn pause_release_without_chart(&self, namespace: &str, name: &str) -> Result<()> {
        for mut workload in self.release_workloads(namespace, name).await? {
            if workload.annotation(ORIGIN_REPLICAS_ANNOTATION).is_none() {
                let replicas = workload.replicas().unwrap_or(1);
                workload.set_annotation(ORIGIN_REPLICAS_ANNOTATION, &replicas.to_string());
            }
            workload.set_replicas(0);
            self.inner.cluster.apply_object(namespace, &workload).await?;
        }
        info!(namespace = %namespace, release = %name, "release paused without chart");
        Ok(())
    }

    /// Restore replicas saved by [`Self::pause_release_without_chart`]
    pub async fn recover_release_without_chart(&self, namespace: &str, name: &str) -> Result<()> {
        for mut workload in self.release_workloads(namespace, name).await? {
            let Some(origin) = workload.annotation(ORIGIN_REPLICAS_ANNOTATION) else {
                continue;
            };
            let replicas: i64 = origin.parse().map_err(|_| {
                WalmError::InvalidArgument(format!(
                    "{} {} has invalid {} annotation '{}'",
                    workload.kind(),
                    workload.name(),
                    ORIGIN_REPLICAS_ANNOTATION,
                    origin
                ))
            })?;
            workload.set_replicas(replicas);
            workload.remove_annotation(ORIGIN_REPLICAS_ANNOTATION);
            self.inner.cluster.apply_object(namespace, &workload).await?;
        }
        info!(namespace = %namespace, release = %name, "release recovered without chart");
        Ok(())
    }

    // ============ Reload / restart ============

    /// Re-resolve dependency outputs and upgrade when they changed
    ///
    /// Returns whether an upgrade was submitted.
    pub async fn reload_release(&self, namespace: &str, name: &str) -> Result<bool> {
        let cache = self.inner.store.get_release_cache(namespace, name).await?;
        let outputs = self
            .inner
            .processor
            .resolver()
            .get_dependency_output_configs(namespace, &cache.spec.dependencies, &cache.chart_info, DEFAULT_STRICT)
            .await?;
        if outputs == cache.dependencies_config_values {
            debug!(namespace = %namespace, release = %name, "dependency outputs unchanged");
            return Ok(false);
        }

        info!(namespace = %namespace, release = %name, "dependency outputs changed, upgrading release");
        self.install_upgrade_release_with_retry(
            namespace,
            cache.spec.to_request(),
            cache.chart_files.clone(),
            None,
            SubmitMode::background(),
        )
        .await?;
        Ok(true)
    }

    pub async fn restart_release(&self, namespace: &str, name: &str) -> Result<()> {
        let mut selector = LabelSelector::new();
        selector.insert(RELEASE_LABEL.to_string(), name.to_string());
        self.restart_pods(namespace, name, &selector).await
    }

    pub async fn restart_isomate(&self, namespace: &str, name: &str, isomate: &str) -> Result<()> {
        let mut selector = LabelSelector::new();
        selector.insert(RELEASE_LABEL.to_string(), name.to_string());
        selector.insert(ISOMATE_NAME_LABEL.to_string(), isomate.to_string());
        self.restart_pods(namespace, name, &selector).await
    }

    /// Delete every selected pod in parallel and aggregate the failures
    async fn restart_pods(&self, namespace: &str, name: &str, selector: &LabelSelector) -> Result<()> {
        let pods = self.inner.cluster.list_pods(namespace, selector).await?;
        let deletions = pods.iter().map(|pod| async move {
            self.inner
                .cluster
                .delete_pod(namespace, pod.name())
                .await
                .map_err(|e| format!("pod {}: {}", pod.name(), e))
        });
        let errors: Vec<String> = join_all(deletions)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect();
        if !errors.is_empty() {
            return Err(WalmError::Aggregate { errors });
        }
        info!(namespace = %namespace, release = %name, pods = pods.len(), "release pods restarted");
        Ok(())
    }

    // ============ Sub-resource updates ============

    async fn release_object(&self, namespace: &str, name: &str, kind: &str, object_name: &str) -> Result<K8sObject> {
        let cache = self.inner.store.get_release_cache(namespace, name).await?;
        if !cache.has_resource(kind, object_name) {
            return Err(WalmError::InvalidArgument(format!(
                "{} {} is not part of release {}/{}",
                kind, object_name, namespace, name
            )));
        }
        self.inner
            .cluster
            .get_object(&ResourceMeta::new(kind, namespace, object_name))
            .await?
            .ok_or_else(|| WalmError::not_found(kind, namespace, object_name))
    }

    /// Replace the spec of an Ingress owned by the release
    pub async fn update_ingress(&self, namespace: &str, name: &str, ingress_name: &str, spec: JsonValue) -> Result<()> {
        let mut ingress = self.release_object(namespace, name, kinds::INGRESS, ingress_name).await?;
        ingress.set(&["spec"], spec);
        self.inner.cluster.apply_object(namespace, &ingress).await
    }

    /// Replace the data of a ConfigMap owned by the release
    pub async fn update_configmap(
        &self,
        namespace: &str,
        name: &str,
        configmap_name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut configmap = self
            .release_object(namespace, name, kinds::CONFIG_MAP, configmap_name)
            .await?;
        configmap.set(&["data"], serde_json::to_value(data)?);
        self.inner.cluster.apply_object(namespace, &configmap).await
    }

    // ============ Queries ============

    async fn output_config(&self, namespace: &str, name: &str) -> Result<JsonValue> {
        match self.inner.cluster.get_release_config(namespace, name).await {
            Ok(config) => Ok(JsonValue::Object(config.spec.output_config)),
            Err(e) if e.is_not_found() => Ok(JsonValue::Object(Map::new())),
            Err(e) => Err(e),
        }
    }

    /// Release view of a task pointer: cached state, live readiness and the
    /// outcome of the latest task
    async fn build_release_info(&self, task: ReleaseTask) -> Result<ReleaseInfoV2> {
        let (namespace, name) = (task.namespace.as_str(), task.name.as_str());
        let cache = self.cached(namespace, name).await?;
        let mut info = match &cache {
            Some(cache) => {
                let mut info = ReleaseInfoV2::from_cache(cache);
                info.output_config = self.output_config(namespace, name).await?;
                let status = release_status(self.inner.cluster.as_ref(), &cache.resources).await?;
                apply_status(&mut info, &status);
                info
            }
            None => ReleaseInfoV2::placeholder(namespace, name),
        };

        let Some(sig) = &task.latest_task_sig else {
            return match cache {
                Some(_) => Ok(info),
                None => Err(WalmError::not_found("Release", namespace, name)),
            };
        };
        match self.sig_state(sig).await? {
            Some(TaskState::Pending | TaskState::Running) => {
                info.msg_code = Some(MsgCode::Pending);
                info.message = format!("please wait for the release latest task {}-{} finished", sig.name, sig.uuid);
            }
            Some(state @ (TaskState::Failure(_) | TaskState::Timeout)) => {
                info.msg_code = Some(failed_msg_code(&sig.name, cache.is_some()));
                info.message = state.error().unwrap_or_default().to_string();
            }
            _ if cache.is_none() => return Err(WalmError::not_found("Release", namespace, name)),
            _ => {}
        }
        Ok(info)
    }

    pub async fn get_release(&self, namespace: &str, name: &str) -> Result<ReleaseInfoV2> {
        let task = self.inner.store.get_release_task(namespace, name).await?;
        self.build_release_info(task).await
    }

    async fn build_release_infos(&self, tasks: Vec<ReleaseTask>) -> Result<Vec<ReleaseInfoV2>> {
        let concurrency = self.inner.config.listing.concurrency.max(1);
        let mut infos: Vec<ReleaseInfoV2> = stream::iter(tasks)
            .map(|task| async move {
                match self.build_release_info(task).await {
                    Err(e) if e.is_not_found() => Ok(None),
                    other => other.map(Some),
                }
            })
            .buffer_unordered(concurrency)
            .try_filter_map(|info| async move { Ok(info) })
            .try_collect()
            .await?;
        infos.sort_by(|a, b| (&a.spec.namespace, &a.spec.name).cmp(&(&b.spec.namespace, &b.spec.name)));
        Ok(infos)
    }

    /// Releases of `namespace` (all namespaces when empty) whose name matches `filter`
    pub async fn list_releases(&self, namespace: &str, filter: &str) -> Result<Vec<ReleaseInfoV2>> {
        let tasks = self.inner.store.get_release_tasks(namespace, filter).await?;
        self.build_release_infos(tasks).await
    }

    /// Releases whose ReleaseConfig matches `selector`
    pub async fn list_releases_by_labels(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ReleaseInfoV2>> {
        let configs = self
            .inner
            .cluster
            .list_release_configs(namespace, selector)
            .await?;
        let tasks = self
            .inner
            .store
            .get_release_tasks_by_release_configs(&configs)
            .await?;
        self.build_release_infos(tasks).await
    }
}
