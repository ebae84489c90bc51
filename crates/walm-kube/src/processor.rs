//! Chart processor
//!
//! One call turns a release request into a [`ReleaseCache`]:
//!
//! 1. load the chart (inline files, then image, then repo coordinates)
//! 2. assemble values: chart defaults, meta-info params, request values,
//!    reused over the previous release on update
//! 3. resolve dependency outputs and merge them into the values
//! 4. build and embed the final plugin list
//! 5. append the auto-generated ReleaseConfig template
//! 6. render once per isomate (or once)
//! 7. apply, rolling back a failed first install
//! 8. record the cache

use chrono::Utc;
use serde_json::{Map, Value as JsonValue, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walm_core::plugin::{embed_plugins, finalize_plugins, merge_plugins, names};
use walm_core::release::AUTO_GEN_LABEL;
use walm_core::values::reuse_values;
use walm_core::{
    ChartFile, LoadedChart, ReleaseCache, ReleaseConfig, ReleaseConfigSpec, ReleasePlugin,
    ReleaseRequest, ReleaseSpec, Values, to_manifest,
};
use walm_engine::{Engine, ReleaseContext, RenderContext};
use walm_repo::{ChartRequest, ChartSource};

use crate::apply::{ApplyRequest, RenderedVariant, ReleaseApplier};
use crate::cluster::ClusterClient;
use crate::error::Result;
use crate::resolver::DependencyResolver;
use crate::store::ReleaseStore;

/// Template name of the generated ReleaseConfig
pub const AUTO_GEN_RELEASE_CONFIG_TEMPLATE: &str = "walm-auto-gen-releaseconfig.yaml";

/// Knobs of one processing run
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Chart uploaded with the request; wins over image and repo coordinates
    pub chart_files: Option<Vec<ChartFile>>,

    /// Last successful render, present when the release already exists
    pub old_release: Option<ReleaseCache>,

    /// `Some` forces the pause plugin on or off, `None` keeps the old state
    pub paused: Option<bool>,

    pub dry_run: bool,

    /// Reuse values, dependencies, labels and plugins of `old_release`
    pub update: bool,

    /// Fail when a dependency has no ReleaseConfig
    pub strict: bool,
}

#[derive(Clone)]
pub struct ChartProcessor {
    charts: Arc<dyn ChartSource>,
    resolver: DependencyResolver,
    applier: Arc<dyn ReleaseApplier>,
    store: ReleaseStore,
    engine: Engine,
}

impl ChartProcessor {
    pub fn new(
        charts: Arc<dyn ChartSource>,
        cluster: Arc<dyn ClusterClient>,
        applier: Arc<dyn ReleaseApplier>,
        store: ReleaseStore,
    ) -> Self {
        Self {
            charts,
            resolver: DependencyResolver::new(cluster),
            applier,
            store,
            engine: Engine::builder().strict(false).build(),
        }
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Render, apply and cache a release
    pub async fn process(
        &self,
        namespace: &str,
        request: ReleaseRequest,
        options: ProcessOptions,
    ) -> Result<ReleaseCache> {
        let old = options.old_release.as_ref();
        let chart_files = options
            .chart_files
            .clone()
            .or_else(|| inherited_chart_files(&request, old));
        request.validate(chart_files.is_some() || old.is_some())?;

        let request = match old {
            Some(old) if options.update => reuse_request(old, request)?,
            Some(old) => inherit_chart_source(old, request),
            None => request,
        };

        let mut chart = self.load_chart(&request, chart_files.clone()).await?;
        let dialect = chart.dialect();
        debug!(
            namespace = %namespace,
            release = %request.name,
            chart = %chart.metadata.name,
            version = %chart.metadata.version,
            dialect = %dialect,
            "chart loaded"
        );

        if let Some(meta) = chart.meta_info() {
            meta.validate_dependency_aliases(
                request.dependencies.iter().filter(|(_, v)| !v.is_empty()).map(|(k, _)| k),
            )?;
        }

        let mut values = chart.default_values.clone();
        if let (Some(meta), Some(params)) = (chart.meta_info(), request.meta_info_params.as_ref()) {
            values.merge(&meta.project_params(params)?);
        }
        values.merge(&request.config_values);

        let dependency_outputs = self
            .resolver
            .get_dependency_output_configs(namespace, &request.dependencies, &chart.info, options.strict)
            .await?;
        values.merge(&Values::from(dependency_outputs.clone()));

        let chart_plugins = chart.meta_info().map(|m| m.plugins.clone()).unwrap_or_default();
        let merged_plugins = merge_plugins(&chart_plugins, &request.plugins)?;
        let plugins = finalize_plugins(merged_plugins.clone(), options.paused);

        let auto_gen = auto_gen_release_config(namespace, &request, &chart, &dependency_outputs);
        chart.add_template(
            AUTO_GEN_RELEASE_CONFIG_TEMPLATE,
            format!("{{% raw %}}{}{{% endraw %}}", to_manifest(&[auto_gen.to_object()?])?),
        );

        let upgrade = old.is_some();
        let release = ReleaseContext::new(&request.name, namespace, upgrade);
        let mut computed_values = values.clone();
        embed_plugins(&mut computed_values, &plugins)?;

        let variants = match request.isomate_config.as_ref().filter(|c| !c.isomates.is_empty()) {
            Some(config) => {
                let mut variants = Vec::with_capacity(config.isomates.len());
                for isomate in &config.isomates {
                    let mut isomate_values = values.clone();
                    isomate_values.merge(&isomate.config_values);
                    let mut isomate_plugins = merge_plugins(&merged_plugins, &isomate.plugins)?;
                    if !isomate_plugins.iter().any(|p| p.name == names::ISOMATE_NAME) {
                        isomate_plugins.push(
                            ReleasePlugin::new(names::ISOMATE_NAME)
                                .with_args(json!({ "name": isomate.name }).to_string()),
                        );
                    }
                    embed_plugins(
                        &mut isomate_values,
                        &finalize_plugins(isomate_plugins, options.paused),
                    )?;
                    variants.push(self.render(&chart, isomate_values, &release)?);
                }
                variants
            }
            None => vec![self.render(&chart, computed_values.clone(), &release)?],
        };

        let apply = ApplyRequest {
            namespace: namespace.to_string(),
            name: request.name.clone(),
            variants,
            previous_manifest: old.map(|o| o.manifest.clone()),
            previous_version: old.map(|o| o.spec.version).unwrap_or(0),
            upgrade,
            dry_run: options.dry_run,
        };
        let planned = self.applier.plan(&apply).await?;
        let applied = if options.dry_run {
            planned
        } else {
            let rollback_manifest = planned.manifest.clone();
            match self.applier.commit(&apply, planned).await {
                Ok(applied) => applied,
                Err(err) => {
                    if !upgrade {
                        warn!(namespace = %namespace, release = %request.name, error = %err, "install failed, deleting partial release");
                        if let Err(e) = self.applier.delete(namespace, &request.name, &rollback_manifest).await {
                            warn!(namespace = %namespace, release = %request.name, error = %e, "rollback delete failed");
                        }
                    }
                    return Err(err);
                }
            }
        };

        let cache = ReleaseCache {
            spec: ReleaseSpec {
                name: request.name.clone(),
                namespace: namespace.to_string(),
                repo_name: request.repo_name.clone(),
                chart_name: chart.metadata.name.clone(),
                chart_version: chart.metadata.version.clone(),
                chart_app_version: chart.metadata.app_version.clone(),
                chart_image: request.chart_image.clone(),
                version: applied.version,
                config_values: request.config_values.clone(),
                dependencies: request.dependencies.clone(),
                release_labels: request.release_labels.clone(),
                plugins,
                meta_info_params: request.meta_info_params.clone(),
                isomate_config: request.isomate_config.clone(),
            },
            meta_info_values: chart.meta_info().map(|m| m.extract_params(&computed_values)),
            computed_values,
            dependencies_config_values: dependency_outputs,
            manifest_digest: manifest_digest(&applied.manifest),
            manifest: applied.manifest,
            resources: applied.resources,
            chart_walm_version: dialect,
            chart_info: chart.info.clone(),
            chart_files,
            updated_at: Utc::now(),
        };

        if !options.dry_run {
            self.store.create_or_update_release_cache(&cache).await?;
            info!(
                namespace = %namespace,
                release = %cache.spec.name,
                version = cache.spec.version,
                digest = %cache.manifest_digest,
                "release cache written"
            );
        }
        Ok(cache)
    }

    pub(crate) async fn load_chart(&self, request: &ReleaseRequest, files: Option<Vec<ChartFile>>) -> Result<LoadedChart> {
        let source = match files {
            Some(files) => ChartRequest::from_files(files),
            None if !request.chart_image.is_empty() => ChartRequest::from_image(&request.chart_image),
            None => ChartRequest::from_repo(&request.repo_name, &request.chart_name, &request.chart_version),
        };
        Ok(self.charts.load(&source).await?)
    }

    fn render(&self, chart: &LoadedChart, values: Values, release: &ReleaseContext) -> Result<RenderedVariant> {
        let context = RenderContext::new(values, release.clone());
        let rendered = self.engine.render_chart(chart, &context)?;
        Ok(RenderedVariant::new(rendered.manifest, context.values))
    }
}

/// Chart files of the old release, when the request names no chart itself
fn inherited_chart_files(request: &ReleaseRequest, old: Option<&ReleaseCache>) -> Option<Vec<ChartFile>> {
    if request.has_chart_source() {
        return None;
    }
    old.and_then(|o| o.chart_files.clone())
}

/// Keep the old chart coordinates when the request omits them
fn inherit_chart_source(old: &ReleaseCache, mut request: ReleaseRequest) -> ReleaseRequest {
    if !request.has_chart_source() {
        request.repo_name = old.spec.repo_name.clone();
        request.chart_name = old.spec.chart_name.clone();
        request.chart_version = old.spec.chart_version.clone();
        request.chart_image = old.spec.chart_image.clone();
    }
    request
}

/// Overlay a request on the previous release
///
/// Values reuse the null-deletes merge, dependencies drop aliases set to an
/// empty string, labels are a plain union and plugins merge by name.
fn reuse_request(old: &ReleaseCache, request: ReleaseRequest) -> Result<ReleaseRequest> {
    let mut request = inherit_chart_source(old, request);

    request.config_values = reuse_values(&old.spec.config_values, &request.config_values);

    let mut dependencies: BTreeMap<String, String> = old.spec.dependencies.clone();
    for (alias, target) in std::mem::take(&mut request.dependencies) {
        if target.is_empty() {
            dependencies.remove(&alias);
        } else {
            dependencies.insert(alias, target);
        }
    }
    request.dependencies = dependencies;

    let mut labels = old.spec.release_labels.clone();
    labels.extend(std::mem::take(&mut request.release_labels));
    request.release_labels = labels;

    request.plugins = merge_plugins(&old.spec.plugins, &request.plugins)?;

    if request.meta_info_params.is_none() {
        request.meta_info_params = old.spec.meta_info_params.clone();
    }
    if request.isomate_config.is_none() {
        request.isomate_config = old.spec.isomate_config.clone();
    }
    Ok(request)
}

fn auto_gen_release_config(
    namespace: &str,
    request: &ReleaseRequest,
    chart: &LoadedChart,
    dependency_outputs: &Map<String, JsonValue>,
) -> ReleaseConfig {
    let mut labels = request.release_labels.clone();
    labels.insert(AUTO_GEN_LABEL.to_string(), "true".to_string());
    ReleaseConfig {
        name: request.name.clone(),
        namespace: namespace.to_string(),
        labels,
        spec: ReleaseConfigSpec {
            config_values: request.config_values.as_map().cloned().unwrap_or_default(),
            dependencies_config_values: dependency_outputs.clone(),
            output_config: Map::new(),
            dependencies: request.dependencies.clone(),
            repo: request.repo_name.clone(),
            chart_name: chart.metadata.name.clone(),
            chart_version: chart.metadata.version.clone(),
            chart_app_version: chart.metadata.app_version.clone(),
            chart_image: request.chart_image.clone(),
            chart_walm_version: chart.dialect(),
        },
    }
}

pub fn manifest_digest(manifest: &str) -> String {
    hex::encode(Sha256::digest(manifest.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ManifestApplier;
    use crate::cluster::MockCluster;
    use crate::plugins::PluginRegistry;
    use walm_core::metainfo::METAINFO_PATH;
    use walm_core::{kinds, plugin};
    use walm_repo::MemoryChartSource;

    const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ release.name }}
spec:
  replicas: {{ values.replicas }}
  template:
    spec:
      containers:
        - name: app
          image: "{{ values.image }}"
"#;

    fn chart_files(meta: Option<&str>) -> Vec<ChartFile> {
        let mut files = vec![
            ChartFile::new("demo/Chart.yaml", "name: demo\nversion: 1.0.0\nappVersion: \"2.0\"\n"),
            ChartFile::new("demo/values.yaml", "replicas: 2\nimage: nginx\n"),
            ChartFile::new("demo/templates/deploy.yaml", DEPLOYMENT),
        ];
        if let Some(meta) = meta {
            files.push(ChartFile::new(format!("demo/{}", METAINFO_PATH), meta));
        }
        files
    }

    struct Fixture {
        cluster: MockCluster,
        charts: MemoryChartSource,
        store: ReleaseStore,
        processor: ChartProcessor,
    }

    fn fixture() -> Fixture {
        let cluster = MockCluster::new();
        let charts = MemoryChartSource::new();
        charts.add_chart("stable", "demo", "1.0.0", &chart_files(None)).unwrap();
        let store = ReleaseStore::in_memory();
        let cluster_client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
        let applier = Arc::new(ManifestApplier::new(cluster_client.clone(), PluginRegistry::with_defaults()));
        let processor = ChartProcessor::new(Arc::new(charts.clone()), cluster_client, applier, store.clone());
        Fixture {
            cluster,
            charts,
            store,
            processor,
        }
    }

    fn request(name: &str) -> ReleaseRequest {
        ReleaseRequest::new(name).with_chart("stable", "demo", "1.0.0")
    }

    #[tokio::test]
    async fn test_install_writes_cache_and_release_config() {
        let f = fixture();
        let req = request("web").with_values(Values::from_yaml("replicas: 3").unwrap());
        let cache = f.processor.process("ns", req, ProcessOptions::default()).await.unwrap();

        assert_eq!(cache.spec.version, 1);
        assert_eq!(cache.spec.chart_app_version, "2.0");
        assert_eq!(cache.computed_values.get("replicas"), Some(&json!(3)));
        assert!(cache.has_resource(kinds::DEPLOYMENT, "web"));
        assert!(cache.has_resource(kinds::RELEASE_CONFIG, "web"));
        assert_eq!(cache.manifest_digest, manifest_digest(&cache.manifest));

        let embedded = plugin::extract_plugins(&cache.computed_values).unwrap();
        assert_eq!(embedded.last().unwrap().name, names::VALIDATE_RELEASE_CONFIG);

        let config = f.cluster.get_release_config("ns", "web").await.unwrap();
        assert!(!config.is_auto_gen());
        assert_eq!(config.spec.chart_name, "demo");
        assert_eq!(config.spec.config_values["replicas"], json!(3));

        assert_eq!(f.store.get_release_cache("ns", "web").await.unwrap(), cache);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let f = fixture();
        let options = ProcessOptions {
            dry_run: true,
            ..Default::default()
        };
        let cache = f.processor.process("ns", request("web"), options).await.unwrap();
        assert!(cache.manifest.contains("kind: Deployment"));
        assert!(f.store.get_release_cache("ns", "web").await.unwrap_err().is_not_found());
        assert_eq!(f.cluster.counts().await.applies, 0);
    }

    #[tokio::test]
    async fn test_cloned_processor_shares_collaborators() {
        let f = fixture();
        let copy = f.processor.clone();
        copy.process("ns", request("web"), ProcessOptions::default()).await.unwrap();
        assert!(f.store.get_release_cache("ns", "web").await.is_ok());
        assert!(f.cluster.object(kinds::DEPLOYMENT, "ns", "web").await.is_some());
    }

    #[tokio::test]
    async fn test_same_request_is_idempotent() {
        let f = fixture();
        let first = f.processor.process("ns", request("web"), ProcessOptions::default()).await.unwrap();
        let options = ProcessOptions {
            old_release: Some(first.clone()),
            update: true,
            ..Default::default()
        };
        let second = f.processor.process("ns", request("web"), options).await.unwrap();
        assert_eq!(first.computed_values, second.computed_values);
        assert_eq!(first.manifest_digest, second.manifest_digest);
        assert_eq!(second.spec.version, 2);
    }

    #[tokio::test]
    async fn test_update_reuses_old_request() {
        let f = fixture();
        let first = request("web")
            .with_values(Values::from_yaml("replicas: 3\nextra: {a: 1}").unwrap())
            .with_label("team", "infra");
        let first = f.processor.process("ns", first, ProcessOptions::default()).await.unwrap();

        let update = ReleaseRequest::new("web")
            .with_values(Values::from_yaml("extra: null\nimage: redis").unwrap())
            .with_label("tier", "db");
        let options = ProcessOptions {
            old_release: Some(first),
            update: true,
            ..Default::default()
        };
        let cache = f.processor.process("ns", update, options).await.unwrap();
        assert_eq!(cache.spec.chart_name, "demo");
        assert_eq!(cache.computed_values.get("replicas"), Some(&json!(3)));
        assert_eq!(cache.computed_values.get("image"), Some(&json!("redis")));
        assert!(cache.spec.config_values.get("extra").is_none());
        assert_eq!(cache.spec.release_labels.len(), 2);
        assert_eq!(f.charts.load_count(), 2);
    }

    #[tokio::test]
    async fn test_pause_toggles_plugin() {
        let f = fixture();
        let options = ProcessOptions {
            paused: Some(true),
            ..Default::default()
        };
        let cache = f.processor.process("ns", request("web"), options).await.unwrap();
        assert!(cache.spec.is_paused());
        let deploy = f.cluster.object(kinds::DEPLOYMENT, "ns", "web").await.unwrap();
        assert_eq!(deploy.replicas(), Some(0));
    }

    #[tokio::test]
    async fn test_failed_install_rolls_back() {
        let f = fixture();
        f.cluster.reject_apply(kinds::RELEASE_CONFIG, "web").await;
        let err = f
            .processor
            .process("ns", request("web"), ProcessOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::WalmError::Apply { .. }), "{err}");
        assert!(f.cluster.object(kinds::DEPLOYMENT, "ns", "web").await.is_none());
        assert!(!f.cluster.deleted().await.is_empty());
        assert!(f.store.get_release_cache("ns", "web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_install_rolls_back_plugin_objects() {
        let f = fixture();
        f.cluster.reject_apply(kinds::RELEASE_CONFIG, "web").await;
        let args = json!({
            "configmapToAdd": {
                "extra": {
                    "applyAllResources": true,
                    "items": [{"data": "k=v", "mountPath": "/etc/extra", "subPath": "extra.conf"}]
                }
            }
        });
        let req = request("web").with_plugin(ReleasePlugin::new(names::CUSTOM_CONFIGMAP).with_args(args.to_string()));
        let err = f.processor.process("ns", req, ProcessOptions::default()).await.unwrap_err();
        assert!(matches!(err, crate::error::WalmError::Apply { .. }), "{err}");

        assert!(f.cluster.object(kinds::CONFIG_MAP, "ns", "walmplugin-extra-web-cm").await.is_none());
        assert!(f.cluster.object(kinds::DEPLOYMENT, "ns", "web").await.is_none());
        assert!(
            f.cluster
                .deleted()
                .await
                .iter()
                .any(|r| r.kind == kinds::CONFIG_MAP && r.name == "walmplugin-extra-web-cm")
        );
    }

    #[tokio::test]
    async fn test_meta_info_params_and_dependencies() {
        let f = fixture();
        let meta = r#"
dependencies:
  - name: db
    chartName: mysql
    aliasConfigVar: DB_CONFIG
plugins:
  - name: LabelPod
    args: '{"labelsToAdd": {"from": "chart"}}'
"#;
        let req = ReleaseRequest::new("web").with_dependency("db", "mysql");
        f.cluster
            .insert_release_config(&ReleaseConfig {
                name: "mysql".into(),
                namespace: "ns".into(),
                spec: ReleaseConfigSpec {
                    output_config: serde_json::from_value(json!({"port": 3306})).unwrap(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let options = ProcessOptions {
            chart_files: Some(chart_files(Some(meta))),
            ..Default::default()
        };
        let cache = f.processor.process("ns", req, options).await.unwrap();
        assert_eq!(cache.dependencies_config_values["DB_CONFIG"], json!({"port": 3306}));
        assert_eq!(cache.computed_values.get("DB_CONFIG.port"), Some(&json!(3306)));
        assert!(cache.spec.plugins.iter().any(|p| p.name == names::LABEL_POD));
        assert!(cache.chart_files.is_some());

        let deploy = f.cluster.object(kinds::DEPLOYMENT, "ns", "web").await.unwrap();
        assert_eq!(deploy.get(&["spec", "template", "metadata", "labels", "from"]).unwrap(), "chart");

        let bad = ReleaseRequest::new("web2").with_dependency("cache", "redis");
        let options = ProcessOptions {
            chart_files: Some(chart_files(Some(meta))),
            ..Default::default()
        };
        let err = f.processor.process("ns", bad, options).await.unwrap_err();
        assert!(err.is_invalid_argument(), "{err}");
    }

    #[tokio::test]
    async fn test_isomates_render_each_variant() {
        let f = fixture();
        let mut files = chart_files(None);
        files[2] = ChartFile::new(
            "demo/templates/deploy.yaml",
            DEPLOYMENT.replace("metadata:\n", "metadata:\n  annotations:\n    NeedIsomateName: \"true\"\n"),
        );
        let mut req = ReleaseRequest::new("web");
        req.isomate_config = Some(walm_core::IsomateConfig {
            default_isomate_name: "blue".into(),
            isomates: vec![
                walm_core::release::Isomate {
                    name: "blue".into(),
                    ..Default::default()
                },
                walm_core::release::Isomate {
                    name: "green".into(),
                    config_values: Values::from_yaml("replicas: 5").unwrap(),
                    ..Default::default()
                },
            ],
        });
        let options = ProcessOptions {
            chart_files: Some(files),
            ..Default::default()
        };
        let cache = f.processor.process("ns", req, options).await.unwrap();
        assert!(cache.has_resource(kinds::DEPLOYMENT, "web-blue"));
        assert!(cache.has_resource(kinds::DEPLOYMENT, "web-green"));
        let green = f.cluster.object(kinds::DEPLOYMENT, "ns", "web-green").await.unwrap();
        assert_eq!(green.replicas(), Some(5));
    }
}
