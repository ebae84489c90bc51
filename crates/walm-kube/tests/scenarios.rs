//! End-to-end release lifecycle scenarios over the in-memory collaborators

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use walm_core::metainfo::METAINFO_PATH;
use walm_core::plugin::names;
use walm_core::release::AUTO_GEN_LABEL;
use walm_core::{ChartFile, MsgCode, ProjectParams, ReleasePlugin, ReleaseRequest, Values, kinds};
use walm_kube::error::TASK_IN_FLIGHT_PREFIX;
use walm_kube::task::{DEFAULT_STATE_RETENTION, handler_fn};
use walm_kube::{
    ChartProcessor, ClusterClient, LocalTaskRunner, ManifestApplier, MockCluster, PluginRegistry,
    ProjectManager, ReleaseApplier, ReleaseManager, ReleaseStore, SubmitMode, TaskRunner, TaskState, WalmConfig,
    WalmError,
};
use walm_repo::MemoryChartSource;

const STATEFULSET: &str = r#"apiVersion: apps/v1
kind: StatefulSet
metadata:
  name: {{ release.name }}
spec:
  replicas: {{ values.replicas }}
  selector:
    matchLabels:
      app: {{ release.name }}
  template:
    metadata:
      labels:
        app: {{ release.name }}
    spec:
      containers:
        - name: app
          image: busybox
"#;

const USER_RELEASE_CONFIG: &str = r#"apiVersion: apiextensions.transwarp.io/v1beta1
kind: ReleaseConfig
metadata:
  name: {{ release.name }}
  labels:
    app: demo
spec:
  outputConfig:
    port: {{ values.port }}
"#;

const DEPENDENT_CONFIGMAP: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ release.name }}-deps
data:
  upstream: "{{ values.a_cfg.port }}"
"#;

struct Harness {
    cluster: MockCluster,
    charts: MemoryChartSource,
    runner: LocalTaskRunner,
    project_runner: LocalTaskRunner,
    releases: ReleaseManager,
    projects: ProjectManager,
}

impl Harness {
    async fn new(concurrency: usize) -> Self {
        Self::with_runners(concurrency, 4, DEFAULT_STATE_RETENTION).await
    }

    async fn with_runners(concurrency: usize, project_concurrency: usize, retention: Duration) -> Self {
        let cluster = MockCluster::new();
        let charts = MemoryChartSource::new();
        let runner = LocalTaskRunner::new(concurrency, 64).with_retention(retention);
        let project_runner = LocalTaskRunner::new(project_concurrency, 64).with_retention(retention);
        let store = ReleaseStore::in_memory();
        let client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
        let applier: Arc<dyn ReleaseApplier> =
            Arc::new(ManifestApplier::new(client.clone(), PluginRegistry::with_defaults()));
        let processor = ChartProcessor::new(Arc::new(charts.clone()), client.clone(), applier.clone(), store.clone());

        let mut config = WalmConfig::default();
        config.retry.interval = Duration::from_millis(100);
        config.task.default_timeout = Duration::from_secs(30);

        let releases = ReleaseManager::new(store, client, Arc::new(runner.clone()), processor, applier, config);
        releases.register_tasks().await;
        let projects = ProjectManager::new(releases.clone(), Arc::new(project_runner.clone()));
        projects.register_tasks().await;

        Self {
            cluster,
            charts,
            runner,
            project_runner,
            releases,
            projects,
        }
    }

    fn add_chart(&self, name: &str, files: Vec<(&str, String)>) {
        let mut chart = vec![ChartFile::new(
            format!("{}/Chart.yaml", name),
            format!("name: {}\nversion: 1.0.0\n", name),
        )];
        for (path, content) in files {
            chart.push(ChartFile::new(format!("{}/{}", name, path), content));
        }
        self.charts.add_chart("stable", name, "1.0.0", &chart).unwrap();
    }

    async fn wait_release_task(&self, namespace: &str, name: &str) {
        let task = self.releases.store().get_release_task(namespace, name).await.unwrap();
        let sig = task.latest_task_sig.unwrap();
        self.runner.wait(&sig, Duration::from_secs(10)).await.unwrap();
    }
}

fn request(name: &str, chart: &str) -> ReleaseRequest {
    ReleaseRequest::new(name).with_chart("stable", chart, "1.0.0")
}

fn sync() -> SubmitMode {
    SubmitMode::sync(10)
}

#[tokio::test]
async fn s1_pause_round_trip() {
    let h = Harness::new(4).await;
    h.add_chart(
        "c",
        vec![
            ("values.yaml", "replicas: 3\n".to_string()),
            ("templates/sts.yaml", STATEFULSET.to_string()),
        ],
    );
    h.releases
        .install_upgrade_release("a", request("r", "c"), None, None, sync())
        .await
        .unwrap();
    assert!(!h.releases.get_release("a", "r").await.unwrap().paused);

    h.releases.pause_or_recover_release("a", "r", true, sync()).await.unwrap();
    let info = h.releases.get_release("a", "r").await.unwrap();
    assert!(info.paused);
    assert_eq!(info.msg_code, Some(MsgCode::Paused));
    assert!(info
        .spec
        .plugins
        .iter()
        .any(|p| p.name == names::PAUSE_RELEASE && !p.disable));
    let sts = h.cluster.object(kinds::STATEFUL_SET, "a", "r").await.unwrap();
    assert_eq!(sts.replicas(), Some(0));

    // already paused: no new task is submitted
    let before = h.releases.store().get_release_task("a", "r").await.unwrap();
    h.releases.pause_or_recover_release("a", "r", true, sync()).await.unwrap();
    let after = h.releases.store().get_release_task("a", "r").await.unwrap();
    assert_eq!(before, after);

    h.releases.pause_or_recover_release("a", "r", false, sync()).await.unwrap();
    assert!(!h.releases.get_release("a", "r").await.unwrap().paused);
    let sts = h.cluster.object(kinds::STATEFUL_SET, "a", "r").await.unwrap();
    assert_eq!(sts.replicas(), Some(3));
}

#[tokio::test]
async fn s2_dependency_ripple() {
    let h = Harness::new(4).await;
    h.add_chart(
        "achart",
        vec![
            ("values.yaml", "port: 8080\n".to_string()),
            ("templates/rc.yaml", USER_RELEASE_CONFIG.to_string()),
        ],
    );
    h.add_chart(
        "bchart",
        vec![
            (
                METAINFO_PATH,
                "dependencies:\n  - name: a\n    chartName: achart\n    aliasConfigVar: a_cfg\n".to_string(),
            ),
            ("templates/cm.yaml", DEPENDENT_CONFIGMAP.to_string()),
        ],
    );

    let params = ProjectParams {
        common_values: Values::new(),
        // listed out of dependency order on purpose
        releases: vec![
            request("b", "bchart").with_dependency("a", "a"),
            request("a", "achart"),
        ],
    };
    h.projects.create_project("ns", "p", params, SubmitMode::sync(30)).await.unwrap();

    let b = h.releases.store().get_release_cache("ns", "b").await.unwrap();
    assert_eq!(b.computed_values.get("a_cfg"), Some(&json!({"port": 8080})));
    let project = h.projects.get_project_info("ns", "p").await.unwrap();
    assert_eq!(project.releases.len(), 2);

    let mut rc = h.cluster.object(kinds::RELEASE_CONFIG, "ns", "a").await.unwrap();
    rc.set(&["spec", "outputConfig", "port"], json!(9090));
    h.cluster.insert(rc).await;

    assert!(h.releases.reload_release("ns", "b").await.unwrap());
    h.wait_release_task("ns", "b").await;

    let b = h.releases.store().get_release_cache("ns", "b").await.unwrap();
    assert_eq!(b.computed_values.get("a_cfg.port"), Some(&json!(9090)));
    let cm = h.cluster.object(kinds::CONFIG_MAP, "ns", "b-deps").await.unwrap();
    assert_eq!(cm.get(&["data", "upstream"]).unwrap(), "9090");

    // nothing changed since: no re-submit
    assert!(!h.releases.reload_release("ns", "b").await.unwrap());
}

#[tokio::test]
async fn s3_cross_dialect_bridge() {
    let h = Harness::new(4).await;
    h.add_chart(
        "xchart",
        vec![
            ("values.yaml", "port: 1\n".to_string()),
            (
                "templates/rc.yaml",
                USER_RELEASE_CONFIG.replace("port: {{ values.port }}", "foo: 1"),
            ),
        ],
    );
    h.add_chart(
        "ychart",
        vec![(
            "transwarp-app.yaml",
            "name: ychart\ndependencies:\n  - name: x\n    chartName: xchart\n    requires:\n      k: \"$(X).foo\"\n"
                .to_string(),
        )],
    );

    h.releases
        .install_upgrade_release("ns", request("x", "xchart"), None, None, sync())
        .await
        .unwrap();
    h.releases
        .install_upgrade_release("ns", request("y", "ychart").with_dependency("x", "x"), None, None, sync())
        .await
        .unwrap();

    let y = h.releases.store().get_release_cache("ns", "y").await.unwrap();
    assert_eq!(y.chart_walm_version.to_string(), "v1");
    assert_eq!(y.dependencies_config_values["xchart"], json!({"k": 1}));
}

#[tokio::test]
async fn s4_in_flight_guard() {
    let h = Harness::new(1).await;
    h.add_chart(
        "c",
        vec![
            ("values.yaml", "replicas: 1\n".to_string()),
            ("templates/sts.yaml", STATEFULSET.to_string()),
        ],
    );
    h.releases
        .install_upgrade_release("a", request("r", "c"), None, None, sync())
        .await
        .unwrap();

    // occupy the only worker so the delete stays queued
    let gate = Arc::new(Notify::new());
    let held = gate.clone();
    h.runner
        .register(
            "Hold-Worker",
            handler_fn(move |_| {
                let gate = held.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            }),
        )
        .await;
    let hold = h.runner.submit("Hold-Worker", json!({}), 0).await.unwrap();
    while h.runner.state(&hold).await.unwrap() != TaskState::Running {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    h.releases
        .delete_release("a", "r", false, SubmitMode::background())
        .await
        .unwrap();
    let err = h
        .releases
        .install_upgrade_release("a", request("r", "c"), None, None, sync())
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with(TASK_IN_FLIGHT_PREFIX), "{err}");
    assert!(err.is_retryable());

    gate.notify_one();
    h.releases
        .install_upgrade_release_with_retry("a", request("r", "c"), None, None, sync())
        .await
        .unwrap();
    let info = h.releases.get_release("a", "r").await.unwrap();
    assert_eq!(info.spec.version, 1);
}

#[tokio::test]
async fn s5_install_rollback() {
    let h = Harness::new(4).await;
    h.add_chart(
        "c",
        vec![
            ("values.yaml", "replicas: 1\n".to_string()),
            ("templates/sts.yaml", STATEFULSET.to_string()),
            ("templates/rc.yaml", USER_RELEASE_CONFIG.replace("{{ values.port }}", "1")),
        ],
    );
    h.cluster.reject_apply(kinds::STATEFUL_SET, "q").await;

    let err = h
        .releases
        .install_upgrade_release("a", request("q", "c"), None, None, sync())
        .await
        .unwrap_err();
    assert!(matches!(err, WalmError::TaskRunner(_)), "{err}");

    let deleted = h.cluster.deleted().await;
    assert!(deleted.iter().any(|r| r.kind == kinds::STATEFUL_SET && r.name == "q"));
    assert!(h.cluster.object(kinds::RELEASE_CONFIG, "a", "q").await.is_none());
    assert!(h
        .releases
        .store()
        .get_release_cache("a", "q")
        .await
        .unwrap_err()
        .is_not_found());

    let info = h.releases.get_release("a", "q").await.unwrap();
    assert_eq!(info.msg_code, Some(MsgCode::InstallFailed));
    assert!(info.resources.is_empty());
}

#[tokio::test]
async fn s6_auto_gen_release_config_merge() {
    let h = Harness::new(4).await;
    h.add_chart(
        "demo",
        vec![
            ("values.yaml", "port: 8080\n".to_string()),
            ("templates/rc.yaml", USER_RELEASE_CONFIG.to_string()),
        ],
    );
    h.releases
        .install_upgrade_release(
            "a",
            request("demo", "demo").with_label("team", "infra"),
            None,
            None,
            sync(),
        )
        .await
        .unwrap();

    let configs = h.cluster.objects_of_kind(kinds::RELEASE_CONFIG, "a").await;
    assert_eq!(configs.len(), 1);
    let rc = &configs[0];
    assert!(rc.label(AUTO_GEN_LABEL).is_none());
    assert_eq!(rc.label("app"), Some("demo"));
    assert_eq!(rc.label("team"), Some("infra"));
    assert_eq!(rc.get(&["spec", "outputConfig", "port"]).unwrap(), &json!(8080));
    assert_eq!(rc.get(&["spec", "chartName"]).unwrap(), "demo");
    assert_eq!(rc.get(&["spec", "repo"]).unwrap(), "stable");
}

#[tokio::test]
async fn project_remove_and_delete() {
    let h = Harness::new(4).await;
    h.add_chart(
        "achart",
        vec![
            ("values.yaml", "port: 8080\n".to_string()),
            ("templates/rc.yaml", USER_RELEASE_CONFIG.to_string()),
        ],
    );
    h.add_chart(
        "bchart",
        vec![
            (
                METAINFO_PATH,
                "dependencies:\n  - name: a\n    chartName: achart\n    aliasConfigVar: a_cfg\n".to_string(),
            ),
            ("templates/cm.yaml", DEPENDENT_CONFIGMAP.to_string()),
        ],
    );

    // b's alias is filled from the batch member providing achart
    let params = ProjectParams {
        common_values: Values::from_yaml("team: infra").unwrap(),
        releases: vec![request("a", "achart"), request("b", "bchart")],
    };
    h.projects.create_project("ns", "p", params, SubmitMode::sync(30)).await.unwrap();
    let b = h.releases.store().get_release_cache("ns", "b").await.unwrap();
    assert_eq!(b.spec.dependencies.get("a").map(String::as_str), Some("a"));
    assert_eq!(b.spec.config_values.get("team"), Some(&json!("infra")));

    h.projects
        .remove_release_in_project("ns", "p", "a", false, SubmitMode::sync(30))
        .await
        .unwrap();
    let b = h.releases.store().get_release_cache("ns", "b").await.unwrap();
    assert!(b.spec.dependencies.is_empty());
    assert!(h.releases.get_release("ns", "a").await.unwrap_err().is_not_found());

    h.projects.delete_project("ns", "p", false, SubmitMode::sync(30)).await.unwrap();
    assert!(h.projects.get_project_info("ns", "p").await.unwrap_err().is_not_found());
    assert!(h.projects.list_projects("ns").await.unwrap().is_empty());
}

#[tokio::test]
async fn project_without_releases_is_rejected() {
    let h = Harness::new(4).await;
    let err = h
        .projects
        .create_project("ns", "empty", ProjectParams::default(), SubmitMode::sync(5))
        .await
        .unwrap_err();
    assert!(err.is_invalid_argument());
}

#[tokio::test]
async fn install_rollback_removes_plugin_objects() {
    let h = Harness::new(4).await;
    h.add_chart(
        "c",
        vec![
            ("values.yaml", "replicas: 1\n".to_string()),
            ("templates/sts.yaml", STATEFULSET.to_string()),
        ],
    );
    h.cluster.reject_apply(kinds::STATEFUL_SET, "q").await;

    let args = json!({
        "configmapToAdd": {
            "extra": {
                "applyAllResources": true,
                "items": [{"data": "k=v", "mountPath": "/etc/extra", "subPath": "extra.conf"}]
            }
        }
    });
    let req = request("q", "c").with_plugin(ReleasePlugin::new(names::CUSTOM_CONFIGMAP).with_args(args.to_string()));
    h.releases
        .install_upgrade_release("a", req, None, None, sync())
        .await
        .unwrap_err();

    assert!(h.cluster.object(kinds::CONFIG_MAP, "a", "walmplugin-extra-q-cm").await.is_none());
    assert!(h.cluster.object(kinds::RELEASE_CONFIG, "a", "q").await.is_none());
    let info = h.releases.get_release("a", "q").await.unwrap();
    assert_eq!(info.msg_code, Some(MsgCode::InstallFailed));
}

#[tokio::test]
async fn concurrent_projects_share_one_release_worker() {
    let h = Harness::with_runners(1, 2, DEFAULT_STATE_RETENTION).await;
    h.add_chart(
        "c",
        vec![
            ("values.yaml", "replicas: 1\n".to_string()),
            ("templates/sts.yaml", STATEFULSET.to_string()),
        ],
    );

    for project in ["p1", "p2"] {
        let params = ProjectParams {
            common_values: Values::new(),
            releases: vec![request(&format!("{project}-r"), "c")],
        };
        h.projects
            .create_project("ns", project, params, SubmitMode::background())
            .await
            .unwrap();
    }

    for project in ["p1", "p2"] {
        let task = h.releases.store().get_project_task("ns", project).await.unwrap();
        let sig = task.latest_task_sig.unwrap();
        let state = h.project_runner.wait(&sig, Duration::from_secs(20)).await.unwrap();
        assert_eq!(state, TaskState::Success, "{project}");
        let info = h.projects.get_project_info("ns", project).await.unwrap();
        assert_eq!(info.releases.len(), 1);
    }
}

#[tokio::test]
async fn deleted_release_task_state_is_dropped() {
    let h = Harness::with_runners(2, 2, Duration::ZERO).await;
    h.add_chart(
        "c",
        vec![
            ("values.yaml", "replicas: 1\n".to_string()),
            ("templates/sts.yaml", STATEFULSET.to_string()),
        ],
    );
    h.releases
        .install_upgrade_release("a", request("gone", "c"), None, None, sync())
        .await
        .unwrap();
    h.releases.delete_release("a", "gone", false, sync()).await.unwrap();
    assert!(h.releases.store().get_release_task("a", "gone").await.unwrap_err().is_not_found());

    h.releases
        .install_upgrade_release("a", request("kept", "c"), None, None, sync())
        .await
        .unwrap();
    // only the latest install is still tracked
    assert_eq!(h.runner.tracked().await, 1);
    let task = h.releases.store().get_release_task("a", "kept").await.unwrap();
    let sig = task.latest_task_sig.unwrap();
    assert_eq!(h.runner.state(&sig).await.unwrap(), TaskState::Success);
}
