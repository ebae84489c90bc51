//! Dependency resolver
//!
//! Turns a release's `alias -> [<namespace>/]<name>` dependency map into the
//! config trees its templates read. The shape depends on the chart dialect:
//! - **v2**: each alias's upstream output config lands under the alias's
//!   `aliasConfigVar`
//! - **v1**: each alias's `requires` statements are evaluated against the
//!   upstream's provides and land under the dependency chart name
//!
//! A v1 release reading a v2 upstream sees the whole output config behind a
//! single bridge entry, and the other way round the bridge is unwrapped.

use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use walm_core::dependency::COMPATIBLE_PROVIDE_KEY;
use walm_core::{ChartDialect, ChartInfo, DependencyMeta, DependencyTarget, ReleaseConfig, Statement};

use crate::cluster::ClusterClient;
use crate::error::{Result, WalmError};

/// Strictness used when a caller has no opinion
pub const DEFAULT_STRICT: bool = false;

#[derive(Clone)]
pub struct DependencyResolver {
    cluster: Arc<dyn ClusterClient>,
}

impl DependencyResolver {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Resolve every dependency of a release living in `namespace`
    ///
    /// With `strict`, an upstream without a ReleaseConfig fails the call;
    /// otherwise that alias is skipped. Empty dependency values are ignored.
    pub async fn get_dependency_output_configs(
        &self,
        namespace: &str,
        dependencies: &BTreeMap<String, String>,
        chart: &ChartInfo,
        strict: bool,
    ) -> Result<Map<String, JsonValue>> {
        let mut outputs = Map::new();
        for (alias, value) in dependencies {
            if value.is_empty() {
                continue;
            }
            let target = DependencyTarget::parse(value, namespace)?;
            match chart.dialect {
                ChartDialect::V2 => self.resolve_v2(alias, &target, chart, strict, &mut outputs).await?,
                ChartDialect::V1 => self.resolve_v1(alias, &target, chart, strict, &mut outputs).await?,
            }
        }
        Ok(outputs)
    }

    /// Upstream ReleaseConfig, or `None` when a non-strict miss is skipped
    async fn upstream_config(
        &self,
        alias: &str,
        target: &DependencyTarget,
        strict: bool,
    ) -> Result<Option<ReleaseConfig>> {
        match self.cluster.get_release_config(&target.namespace, &target.name).await {
            Ok(config) => Ok(Some(config)),
            Err(e) if e.is_not_found() => {
                if strict {
                    return Err(WalmError::UpstreamStrictMiss {
                        alias: alias.to_string(),
                        namespace: target.namespace.clone(),
                        name: target.name.clone(),
                    });
                }
                warn!(alias = %alias, upstream = %target, "dependency ReleaseConfig not found, skipped");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_v2(
        &self,
        alias: &str,
        target: &DependencyTarget,
        chart: &ChartInfo,
        strict: bool,
        outputs: &mut Map<String, JsonValue>,
    ) -> Result<()> {
        let declared = chart
            .meta_info
            .as_ref()
            .and_then(|meta| meta.dependency(alias))
            .ok_or_else(|| {
                WalmError::InvalidArgument(format!(
                    "dependency alias '{}' is not declared by chart meta-info",
                    alias
                ))
            })?;

        let output = match self
            .cluster
            .get_dependency_meta(&target.namespace, &target.name)
            .await?
        {
            Some(meta) => unwrap_bridge(meta.flatten()),
            None => match self.upstream_config(alias, target, strict).await? {
                Some(config) => config.spec.output_config,
                None => return Ok(()),
            },
        };

        if output.is_empty() {
            debug!(alias = %alias, upstream = %target, "upstream output config is empty");
            return Ok(());
        }
        outputs.insert(declared.config_var().to_string(), JsonValue::Object(output));
        Ok(())
    }

    async fn resolve_v1(
        &self,
        alias: &str,
        target: &DependencyTarget,
        chart: &ChartInfo,
        strict: bool,
        outputs: &mut Map<String, JsonValue>,
    ) -> Result<()> {
        let declared = chart
            .app_info
            .as_ref()
            .and_then(|app| app.dependency(alias))
            .ok_or_else(|| {
                WalmError::InvalidArgument(format!(
                    "dependency alias '{}' is not declared by the chart's application info",
                    alias
                ))
            })?;

        let meta = match self
            .cluster
            .get_dependency_meta(&target.namespace, &target.name)
            .await?
        {
            Some(meta) => meta,
            None => match self.upstream_config(alias, target, strict).await? {
                Some(config) => legacy_meta_of(&config),
                None => return Ok(()),
            },
        };

        let mut resolved = Map::new();
        for (key, statement) in &declared.requires {
            let statement = Statement::parse(statement).map_err(|e| {
                WalmError::InvalidArgument(format!(
                    "dependency '{}' requires '{}': {}",
                    alias, key, e
                ))
            })?;
            let value = meta.evaluate(&statement).map_err(|e| {
                WalmError::InvalidArgument(format!(
                    "dependency '{}' requires '{}' from {}: {}",
                    alias, key, target, e
                ))
            })?;
            resolved.insert(key.clone(), value);
        }

        match outputs
            .entry(declared.result_key().to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()))
        {
            JsonValue::Object(existing) => existing.extend(resolved),
            other => *other = JsonValue::Object(resolved),
        }
        Ok(())
    }
}

/// Provides of an upstream known only through its ReleaseConfig
fn legacy_meta_of(config: &ReleaseConfig) -> DependencyMeta {
    let output = JsonValue::Object(config.spec.output_config.clone());
    match config.spec.chart_walm_version {
        ChartDialect::V1 => DependencyMeta::from_output_config(&output),
        ChartDialect::V2 => DependencyMeta::bridge(&output),
    }
}

/// A lone bridge entry stands for the whole output config
fn unwrap_bridge(mut flat: Map<String, JsonValue>) -> Map<String, JsonValue> {
    if flat.len() == 1 {
        if let Some(JsonValue::Object(inner)) = flat.remove(COMPATIBLE_PROVIDE_KEY) {
            return inner;
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        DUMMY_SERVICE_FLAG_LABEL, DUMMY_SERVICE_INSTALL_LABEL, DUMMY_SERVICE_META_ANNOTATION,
        INSTANCE_API_VERSION, INSTANCE_KIND, MockCluster,
    };
    use serde_json::json;
    use walm_core::{ChartMetaInfo, K8sObject, LegacyAppInfo, kinds};

    fn v2_chart() -> ChartInfo {
        let meta = ChartMetaInfo::from_yaml(
            r#"
chartDependenciesInfo:
  - name: a
    aliasConfigVar: a_cfg
  - name: zk
"#,
        )
        .unwrap();
        ChartInfo {
            dialect: ChartDialect::V2,
            meta_info: Some(meta),
            app_info: None,
        }
    }

    fn v1_chart() -> ChartInfo {
        let app = LegacyAppInfo::from_yaml(
            r#"
name: y
dependencies:
  - name: x
    chartName: xchart
    requires:
      k: "$(X).foo"
"#,
        )
        .unwrap();
        ChartInfo {
            dialect: ChartDialect::V1,
            meta_info: None,
            app_info: Some(app),
        }
    }

    async fn upstream(cluster: &MockCluster, namespace: &str, name: &str, dialect: ChartDialect, output: JsonValue) {
        let mut config = ReleaseConfig {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        };
        config.spec.chart_walm_version = dialect;
        if let JsonValue::Object(map) = output {
            config.spec.output_config = map;
        }
        cluster.insert_release_config(&config).await.unwrap();
    }

    fn deps(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_v2_output_config() {
        let cluster = MockCluster::new();
        upstream(&cluster, "ns", "a", ChartDialect::V2, json!({"port": 8080})).await;
        upstream(&cluster, "other", "zk", ChartDialect::V2, json!({"addr": "zk:2181"})).await;
        let resolver = DependencyResolver::new(Arc::new(cluster));

        let out = resolver
            .get_dependency_output_configs("ns", &deps(&[("a", "a"), ("zk", "other/zk")]), &v2_chart(), false)
            .await
            .unwrap();
        assert_eq!(out["a_cfg"], json!({"port": 8080}));
        assert_eq!(out["zk"], json!({"addr": "zk:2181"}));
    }

    #[tokio::test]
    async fn test_v2_missing_upstream() {
        let resolver = DependencyResolver::new(Arc::new(MockCluster::new()));
        let dependencies = deps(&[("a", "a")]);

        let out = resolver
            .get_dependency_output_configs("ns", &dependencies, &v2_chart(), DEFAULT_STRICT)
            .await
            .unwrap();
        assert!(out.is_empty());

        let err = resolver
            .get_dependency_output_configs("ns", &dependencies, &v2_chart(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, WalmError::UpstreamStrictMiss { .. }));
    }

    #[tokio::test]
    async fn test_v2_undeclared_alias_and_empty_output() {
        let cluster = MockCluster::new();
        upstream(&cluster, "ns", "a", ChartDialect::V2, json!({})).await;
        let resolver = DependencyResolver::new(Arc::new(cluster));

        let err = resolver
            .get_dependency_output_configs("ns", &deps(&[("nope", "a")]), &v2_chart(), false)
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());

        let out = resolver
            .get_dependency_output_configs("ns", &deps(&[("a", "a"), ("zk", "")]), &v2_chart(), true)
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_v2_prefers_legacy_instance() {
        let cluster = MockCluster::new();
        upstream(&cluster, "ns", "zk", ChartDialect::V1, json!({"stale": true})).await;
        let mut instance = K8sObject::new(INSTANCE_API_VERSION, INSTANCE_KIND, "zk");
        instance.set_namespace("ns");
        instance.set(
            &["status", "dependencyMeta"],
            json!({"provides": {"addr": {"immediateValue": "zk-0:2181"}}}),
        );
        cluster.insert(instance).await;
        let resolver = DependencyResolver::new(Arc::new(cluster));

        let out = resolver
            .get_dependency_output_configs("ns", &deps(&[("zk", "zk")]), &v2_chart(), false)
            .await
            .unwrap();
        assert_eq!(out["zk"], json!({"addr": "zk-0:2181"}));
    }

    #[tokio::test]
    async fn test_v1_reads_v2_through_bridge() {
        let cluster = MockCluster::new();
        upstream(&cluster, "ns", "x", ChartDialect::V2, json!({"foo": 1})).await;
        let resolver = DependencyResolver::new(Arc::new(cluster));

        let out = resolver
            .get_dependency_output_configs("ns", &deps(&[("x", "x")]), &v1_chart(), false)
            .await
            .unwrap();
        assert_eq!(out["xchart"], json!({"k": 1}));
    }

    #[tokio::test]
    async fn test_v1_reads_dummy_service_meta() {
        let cluster = MockCluster::new();
        let mut service = K8sObject::new("v1", kinds::SERVICE, "x-meta");
        service.set_namespace("ns");
        service.set_label(DUMMY_SERVICE_INSTALL_LABEL, "x");
        service.set_label(DUMMY_SERVICE_FLAG_LABEL, "true");
        service.set_annotation(
            DUMMY_SERVICE_META_ANNOTATION,
            r#"{"provides":{"X":{"immediateValue":{"foo":"legacy"}}}}"#,
        );
        cluster.insert(service).await;
        let resolver = DependencyResolver::new(Arc::new(cluster));

        let out = resolver
            .get_dependency_output_configs("ns", &deps(&[("x", "x")]), &v1_chart(), true)
            .await
            .unwrap();
        assert_eq!(out["xchart"]["k"], "legacy");
    }

    #[tokio::test]
    async fn test_v1_missing_path_fails() {
        let cluster = MockCluster::new();
        upstream(&cluster, "ns", "x", ChartDialect::V1, json!({"bar": 1})).await;
        let resolver = DependencyResolver::new(Arc::new(cluster));

        let err = resolver
            .get_dependency_output_configs("ns", &deps(&[("x", "x")]), &v1_chart(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires 'k'"));
    }

    #[test]
    fn test_unwrap_bridge() {
        let bridged = DependencyMeta::bridge(&json!({"foo": 1})).flatten();
        assert_eq!(JsonValue::Object(unwrap_bridge(bridged)), json!({"foo": 1}));

        let mut mixed = Map::new();
        mixed.insert(COMPATIBLE_PROVIDE_KEY.into(), json!({"foo": 1}));
        mixed.insert("bar".into(), json!(2));
        assert_eq!(unwrap_bridge(mixed.clone()), mixed);
    }
}
