//! Project orchestration
//!
//! A project is the set of releases labelled `Project-Name=<project>`.
//! Batches are installed in dependency order; siblings that depend on a
//! changed or removed member are re-submitted so their dependency outputs
//! follow.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use walm_core::release::PROJECT_NAME_LABEL;
use walm_core::{DependencyTarget, ProjectInfo, ProjectParams, ProjectTask, ReleaseInfoV2, ReleaseRequest, TaskSig};

use crate::cluster::LabelSelector;
use crate::error::{Result, WalmError};
use crate::release::{ReleaseManager, SubmitMode};
use crate::task::{TaskRunner, TaskState, handler_fn};

pub const CREATE_PROJECT_TASK: &str = "Create-Project-Task";
pub const ADD_RELEASES_TO_PROJECT_TASK: &str = "Add-Releases-To-Project-Task";
pub const REMOVE_RELEASE_FROM_PROJECT_TASK: &str = "Remove-Release-From-Project-Task";
pub const DELETE_PROJECT_TASK: &str = "Delete-Project-Task";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectReleasesTaskArgs {
    pub namespace: String,
    pub name: String,
    pub project_params: ProjectParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveReleaseTaskArgs {
    pub namespace: String,
    pub name: String,
    pub release_name: String,
    #[serde(default)]
    pub delete_pvcs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteProjectTaskArgs {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub delete_pvcs: bool,
}

fn from_args<T: serde::de::DeserializeOwned>(task: &str, args: JsonValue) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| WalmError::TaskRunner(format!("invalid arguments for task {}: {}", task, e)))
}

/// Order nodes so every node comes after the nodes it depends on
///
/// Dependencies outside the node set are ignored. Ties keep input order.
pub fn dependency_order(nodes: &[(String, BTreeSet<String>)]) -> Result<Vec<usize>> {
    let index: BTreeMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();
    let edges: Vec<Vec<usize>> = nodes
        .iter()
        .enumerate()
        .map(|(i, (_, deps))| {
            deps.iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .filter(|&j| j != i)
                .collect()
        })
        .collect();

    let mut placed = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    while order.len() < nodes.len() {
        let next = (0..nodes.len()).find(|&i| !placed[i] && edges[i].iter().all(|&j| placed[j]));
        match next {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => {
                let cycle: Vec<&str> = (0..nodes.len())
                    .filter(|&i| !placed[i])
                    .map(|i| nodes[i].0.as_str())
                    .collect();
                return Err(WalmError::DependencyCycle {
                    cycle: cycle.join(" -> "),
                });
            }
        }
    }
    Ok(order)
}

/// Release names in `namespace` that `dependencies` points at
fn dependency_targets(namespace: &str, dependencies: &BTreeMap<String, String>) -> Result<BTreeSet<String>> {
    let mut targets = BTreeSet::new();
    for value in dependencies.values().filter(|v| !v.is_empty()) {
        let target = DependencyTarget::parse(value, namespace)?;
        if target.namespace == namespace {
            targets.insert(target.name);
        }
    }
    Ok(targets)
}

fn project_selector(name: &str) -> LabelSelector {
    let mut selector = LabelSelector::new();
    selector.insert(PROJECT_NAME_LABEL.to_string(), name.to_string());
    selector
}

/// Project lifecycle on top of a [`ReleaseManager`]
///
/// Project tasks block on release tasks, so they run on their own runner
/// and never hold a slot the release tasks need.
#[derive(Clone)]
pub struct ProjectManager {
    releases: ReleaseManager,
    runner: Arc<dyn TaskRunner>,
}

impl ProjectManager {
    pub fn new(releases: ReleaseManager, runner: Arc<dyn TaskRunner>) -> Self {
        Self { releases, runner }
    }

    pub fn releases(&self) -> &ReleaseManager {
        &self.releases
    }

    pub async fn register_tasks(&self) {
        let runner = self.runner.clone();

        let manager = self.clone();
        runner
            .register(
                CREATE_PROJECT_TASK,
                handler_fn(move |args| {
                    let manager = manager.clone();
                    async move {
                        let args: ProjectReleasesTaskArgs = from_args(CREATE_PROJECT_TASK, args)?;
                        manager.run_add_releases(args).await
                    }
                }),
            )
            .await;

        let manager = self.clone();
        runner
            .register(
                ADD_RELEASES_TO_PROJECT_TASK,
                handler_fn(move |args| {
                    let manager = manager.clone();
                    async move {
                        let args: ProjectReleasesTaskArgs = from_args(ADD_RELEASES_TO_PROJECT_TASK, args)?;
                        manager.run_add_releases(args).await
                    }
                }),
            )
            .await;

        let manager = self.clone();
        runner
            .register(
                REMOVE_RELEASE_FROM_PROJECT_TASK,
                handler_fn(move |args| {
                    let manager = manager.clone();
                    async move {
                        manager
                            .run_remove_release(from_args(REMOVE_RELEASE_FROM_PROJECT_TASK, args)?)
                            .await
                    }
                }),
            )
            .await;

        let manager = self.clone();
        runner
            .register(
                DELETE_PROJECT_TASK,
                handler_fn(move |args| {
                    let manager = manager.clone();
                    async move { manager.run_delete_project(from_args(DELETE_PROJECT_TASK, args)?).await }
                }),
            )
            .await;
    }

    // ============ Task submission ============

    async fn project_task(&self, namespace: &str, name: &str) -> Result<Option<ProjectTask>> {
        match self.releases.store().get_project_task(namespace, name).await {
            Ok(task) => Ok(Some(task)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn sig_state(&self, sig: &TaskSig) -> Result<Option<TaskState>> {
        match self.runner.state(sig).await {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn submit_project_task(
        &self,
        namespace: &str,
        name: &str,
        task_name: &str,
        args: JsonValue,
        mode: SubmitMode,
    ) -> Result<()> {
        let previous = self
            .project_task(namespace, name)
            .await?
            .and_then(|t| t.latest_task_sig);
        if let Some(sig) = &previous {
            if let Some(state) = self.sig_state(sig).await? {
                if !state.is_terminal() {
                    return Err(WalmError::ProjectTaskInFlight {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        task: format!("{}-{}", sig.name, sig.uuid),
                    });
                }
            }
        }

        let runner = &self.runner;
        let timeout_sec = self.releases.timeout_sec(mode.timeout_sec);
        let sig = runner.submit(task_name, args, timeout_sec).await?;
        self.releases
            .store()
            .create_or_update_project_task(&ProjectTask {
                namespace: namespace.to_string(),
                name: name.to_string(),
                latest_task_sig: Some(sig.clone()),
                timeout_sec,
            })
            .await?;
        info!(namespace = %namespace, project = %name, task = %task_name, uuid = %sig.uuid, "project task submitted");

        if let Some(old) = previous {
            if let Err(e) = runner.purge(&old).await {
                debug!(namespace = %namespace, project = %name, uuid = %old.uuid, error = %e, "failed to purge previous task state");
            }
        }

        if mode.async_mode {
            return Ok(());
        }
        match runner.wait(&sig, Duration::from_secs(timeout_sec)).await? {
            TaskState::Timeout => Err(WalmError::Timeout(format!(
                "{}s running task {} of project {}/{}",
                timeout_sec, task_name, namespace, name
            ))),
            TaskState::Failure(message) => Err(WalmError::TaskRunner(format!(
                "task {} of project {}/{} failed: {}",
                task_name, namespace, name, message
            ))),
            _ => Ok(()),
        }
    }

    // ============ Operations ============

    pub async fn create_project(
        &self,
        namespace: &str,
        name: &str,
        params: ProjectParams,
        mode: SubmitMode,
    ) -> Result<()> {
        if params.releases.is_empty() {
            return Err(WalmError::InvalidArgument(format!(
                "project {}/{} has no releases",
                namespace, name
            )));
        }
        if self.project_task(namespace, name).await?.is_some() {
            return Err(WalmError::InvalidArgument(format!(
                "project {}/{} already exists",
                namespace, name
            )));
        }
        for release in &params.releases {
            release.validate(false)?;
        }
        let args = serde_json::to_value(ProjectReleasesTaskArgs {
            namespace: namespace.to_string(),
            name: name.to_string(),
            project_params: params,
        })?;
        self.submit_project_task(namespace, name, CREATE_PROJECT_TASK, args, mode)
            .await
    }

    /// Install or upgrade releases of an existing project
    pub async fn add_releases_in_project(
        &self,
        namespace: &str,
        name: &str,
        params: ProjectParams,
        mode: SubmitMode,
    ) -> Result<()> {
        let args = serde_json::to_value(ProjectReleasesTaskArgs {
            namespace: namespace.to_string(),
            name: name.to_string(),
            project_params: params,
        })?;
        self.submit_project_task(namespace, name, ADD_RELEASES_TO_PROJECT_TASK, args, mode)
            .await
    }

    pub async fn remove_release_in_project(
        &self,
        namespace: &str,
        name: &str,
        release_name: &str,
        delete_pvcs: bool,
        mode: SubmitMode,
    ) -> Result<()> {
        let args = serde_json::to_value(RemoveReleaseTaskArgs {
            namespace: namespace.to_string(),
            name: name.to_string(),
            release_name: release_name.to_string(),
            delete_pvcs,
        })?;
        self.submit_project_task(namespace, name, REMOVE_RELEASE_FROM_PROJECT_TASK, args, mode)
            .await
    }

    pub async fn delete_project(
        &self,
        namespace: &str,
        name: &str,
        delete_pvcs: bool,
        mode: SubmitMode,
    ) -> Result<()> {
        if self.project_task(namespace, name).await?.is_none() && self.members(namespace, name).await?.is_empty() {
            info!(namespace = %namespace, project = %name, "project does not exist, nothing to delete");
            return Ok(());
        }
        let args = serde_json::to_value(DeleteProjectTaskArgs {
            namespace: namespace.to_string(),
            name: name.to_string(),
            delete_pvcs,
        })?;
        self.submit_project_task(namespace, name, DELETE_PROJECT_TASK, args, mode)
            .await
    }

    pub async fn get_project_info(&self, namespace: &str, name: &str) -> Result<ProjectInfo> {
        let task = self.project_task(namespace, name).await?;
        let releases = self
            .releases
            .list_releases_by_labels(namespace, &project_selector(name))
            .await?;
        if task.is_none() && releases.is_empty() {
            return Err(WalmError::not_found("Project", namespace, name));
        }

        let mut info = ProjectInfo::from_releases(namespace, name, releases);
        if let Some(sig) = task.and_then(|t| t.latest_task_sig) {
            match self.sig_state(&sig).await? {
                Some(TaskState::Pending | TaskState::Running) => {
                    info.ready = false;
                    info.message = format!("please wait for the project latest task {}-{} finished", sig.name, sig.uuid);
                }
                Some(state @ (TaskState::Failure(_) | TaskState::Timeout)) => {
                    info.ready = false;
                    info.message = format!("project task {} failed: {}", sig.name, state.error().unwrap_or_default());
                }
                _ => {}
            }
        }
        Ok(info)
    }

    pub async fn list_projects(&self, namespace: &str) -> Result<Vec<ProjectInfo>> {
        let tasks = self.releases.store().get_project_tasks(namespace, "").await?;
        let mut projects = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.get_project_info(&task.namespace, &task.name).await {
                Ok(info) => projects.push(info),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        projects.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(projects)
    }

    // ============ Task bodies ============

    /// Releases whose config carries the project label
    async fn members(&self, namespace: &str, name: &str) -> Result<Vec<ReleaseInfoV2>> {
        self.releases
            .list_releases_by_labels(namespace, &project_selector(name))
            .await
    }

    fn member_mode(&self) -> SubmitMode {
        SubmitMode::sync(0)
    }

    /// Fill aliases a chart declares when another batch member provides that chart
    async fn auto_include_dependencies(&self, requests: &mut [ReleaseRequest]) -> Result<()> {
        let providers: BTreeMap<String, String> = requests
            .iter()
            .filter(|r| !r.chart_name.is_empty())
            .map(|r| (r.chart_name.clone(), r.name.clone()))
            .collect();
        for request in requests.iter_mut().filter(|r| r.has_chart_source()) {
            let chart = self.releases.processor().load_chart(request, None).await?;
            let Some(meta) = chart.meta_info() else {
                continue;
            };
            for dependency in &meta.chart_dependencies_info {
                if request.dependencies.contains_key(&dependency.name) {
                    continue;
                }
                if let Some(provider) = providers.get(&dependency.chart_name) {
                    if provider != &request.name {
                        debug!(release = %request.name, alias = %dependency.name, provider = %provider, "auto-including dependency");
                        request.dependencies.insert(dependency.name.clone(), provider.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Label every request with the project, merge the common values under
    /// its own and fill auto-included dependencies
    pub(crate) async fn prepare_requests(&self, project: &str, params: ProjectParams) -> Result<Vec<ReleaseRequest>> {
        let common = params.common_values;
        let mut requests: Vec<ReleaseRequest> = params
            .releases
            .into_iter()
            .map(|mut request| {
                request
                    .release_labels
                    .insert(PROJECT_NAME_LABEL.to_string(), project.to_string());
                let mut values = common.clone();
                values.merge(&request.config_values);
                request.config_values = values;
                request
            })
            .collect();
        self.auto_include_dependencies(&mut requests).await?;
        Ok(requests)
    }

    async fn run_add_releases(&self, args: ProjectReleasesTaskArgs) -> Result<()> {
        let (namespace, project) = (args.namespace.as_str(), args.name.as_str());
        let requests = self.prepare_requests(project, args.project_params).await?;

        let nodes = requests
            .iter()
            .map(|r| Ok((r.name.clone(), dependency_targets(namespace, &r.dependencies)?)))
            .collect::<Result<Vec<_>>>()?;
        let order = dependency_order(&nodes)?;

        let batch: BTreeSet<String> = requests.iter().map(|r| r.name.clone()).collect();
        for i in order {
            let request = requests[i].clone();
            info!(namespace = %namespace, project = %project, release = %request.name, "installing project release");
            self.releases
                .install_upgrade_release_with_retry(namespace, request, None, None, self.member_mode())
                .await?;
        }

        self.ripple(namespace, project, &batch, None).await?;
        info!(namespace = %namespace, project = %project, releases = batch.len(), "project releases installed");
        Ok(())
    }

    /// Re-submit siblings outside `changed` that depend on one of its releases
    ///
    /// With `removed`, aliases pointing at that release are dropped from the
    /// sibling's dependency map.
    async fn ripple(
        &self,
        namespace: &str,
        project: &str,
        changed: &BTreeSet<String>,
        removed: Option<&str>,
    ) -> Result<()> {
        for sibling in self.members(namespace, project).await? {
            if changed.contains(&sibling.spec.name) {
                continue;
            }
            let mut request = sibling.spec.to_request();
            let mut affected = false;
            for value in request.dependencies.values_mut() {
                if value.is_empty() {
                    continue;
                }
                let target = DependencyTarget::parse(value, namespace)?;
                if target.namespace != namespace || !changed.contains(&target.name) {
                    continue;
                }
                affected = true;
                if removed == Some(target.name.as_str()) {
                    // empty value removes the alias on reuse
                    value.clear();
                }
            }
            if !affected {
                continue;
            }
            info!(namespace = %namespace, project = %project, release = %sibling.spec.name, "re-submitting affected release");
            self.releases
                .upgrade_release_in_project_with_retry(namespace, project, request, self.member_mode())
                .await?;
        }
        Ok(())
    }

    async fn run_remove_release(&self, args: RemoveReleaseTaskArgs) -> Result<()> {
        let (namespace, project) = (args.namespace.as_str(), args.name.as_str());
        let mut removed = BTreeSet::new();
        removed.insert(args.release_name.clone());
        self.ripple(namespace, project, &removed, Some(&args.release_name))
            .await?;
        self.releases
            .delete_release_with_retry(namespace, &args.release_name, args.delete_pvcs, self.member_mode())
            .await?;
        info!(namespace = %namespace, project = %project, release = %args.release_name, "release removed from project");
        Ok(())
    }

    async fn run_delete_project(&self, args: DeleteProjectTaskArgs) -> Result<()> {
        let (namespace, project) = (args.namespace.as_str(), args.name.as_str());
        let members = self.members(namespace, project).await?;
        let nodes = members
            .iter()
            .map(|m| Ok((m.spec.name.clone(), dependency_targets(namespace, &m.spec.dependencies)?)))
            .collect::<Result<Vec<_>>>()?;
        let order = match dependency_order(&nodes) {
            Ok(order) => order,
            Err(e) => {
                warn!(namespace = %namespace, project = %project, error = %e, "deleting project releases in listing order");
                (0..nodes.len()).collect()
            }
        };

        for i in order.into_iter().rev() {
            let name = &nodes[i].0;
            info!(namespace = %namespace, project = %project, release = %name, "deleting project release");
            self.releases
                .delete_release_with_retry(namespace, name, args.delete_pvcs, self.member_mode())
                .await?;
        }
        self.releases
            .store()
            .delete_project_task(namespace, project)
            .await?;
        info!(namespace = %namespace, project = %project, "project deleted");
        Ok(())
    }
}
