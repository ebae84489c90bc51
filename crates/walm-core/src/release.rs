//! Release requests, cached release state and task pointers

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;

use crate::chart::{ChartDialect, ChartFile, ChartInfo};
use crate::error::{CoreError, Result};
use crate::metainfo::MetaInfoParams;
use crate::object::K8sObject;
use crate::plugin::{self, ReleasePlugin};
use crate::values::Values;

/// Label carrying the project a release belongs to
pub const PROJECT_NAME_LABEL: &str = "Project-Name";

/// Label marking the ReleaseConfig synthesized during processing
pub const AUTO_GEN_LABEL: &str = "auto-gen";

/// Reserved values keys injected for legacy charts
pub mod reserved {
    pub const APPLICATION_PAUSE: &str = "Transwarp_Application_Pause";
    pub const INSTALL_NAMESPACE: &str = "Transwarp_Install_Namespace";
    pub const HELM_RELEASE_NAME: &str = "helmReleaseName";
    pub const HELM_RELEASE_NAMESPACE: &str = "helmReleaseNamespace";
    pub const CHART_VERSION: &str = "chartVersion";
    pub const CHART_NAME: &str = "chartName";
    pub const CHART_APP_VERSION: &str = "chartAppVersion";
}

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

/// Validate a Kubernetes DNS label (release names, dependency targets)
pub fn validate_dns_label(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::invalid("name must not be empty"));
    }
    if name.len() > 63 {
        return Err(CoreError::invalid(format!(
            "name '{}' is longer than 63 characters",
            name
        )));
    }
    if !DNS_LABEL.is_match(name) {
        return Err(CoreError::invalid(format!(
            "name '{}' is not a valid DNS label",
            name
        )));
    }
    Ok(())
}

// ========== Requests ==========

/// One variant of a multi-variant (isomate) release
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Isomate {
    pub name: String,

    #[serde(default)]
    pub config_values: Values,

    #[serde(default)]
    pub plugins: Vec<ReleasePlugin>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsomateConfig {
    #[serde(default)]
    pub default_isomate_name: String,

    #[serde(default)]
    pub isomates: Vec<Isomate>,
}

/// Caller request to install or upgrade a release
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub name: String,

    #[serde(default)]
    pub repo_name: String,

    #[serde(default)]
    pub chart_name: String,

    #[serde(default)]
    pub chart_version: String,

    #[serde(default)]
    pub chart_image: String,

    #[serde(default)]
    pub config_values: Values,

    /// Alias to `[<namespace>/]<name>`; an empty value removes the alias on update
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    #[serde(default)]
    pub release_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub plugins: Vec<ReleasePlugin>,

    #[serde(default)]
    pub meta_info_params: Option<MetaInfoParams>,

    #[serde(default)]
    pub isomate_config: Option<IsomateConfig>,
}

impl ReleaseRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_chart(mut self, repo: &str, chart: &str, version: &str) -> Self {
        self.repo_name = repo.to_string();
        self.chart_name = chart.to_string();
        self.chart_version = version.to_string();
        self
    }

    pub fn with_values(mut self, values: Values) -> Self {
        self.config_values = values;
        self
    }

    pub fn with_dependency(mut self, alias: &str, target: &str) -> Self {
        self.dependencies.insert(alias.to_string(), target.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.release_labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_plugin(mut self, plugin: ReleasePlugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// True when the request names a chart by image or by repo coordinates
    pub fn has_chart_source(&self) -> bool {
        !self.chart_image.is_empty() || !self.chart_name.is_empty()
    }

    /// Reject requests that can never succeed
    pub fn validate(&self, has_chart_files: bool) -> Result<()> {
        validate_dns_label(&self.name)?;
        if !has_chart_files && !self.has_chart_source() {
            return Err(CoreError::invalid(format!(
                "release '{}' names neither chart files, a chart image nor a chart name",
                self.name
            )));
        }
        plugin::merge_plugins(&[], &self.plugins)?;
        Ok(())
    }
}

// ========== Cached state ==========

/// Echo of the request as it was last applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    pub name: String,
    pub namespace: String,

    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub chart_name: String,
    #[serde(default)]
    pub chart_version: String,
    #[serde(default)]
    pub chart_app_version: String,
    #[serde(default)]
    pub chart_image: String,

    /// Apply counter reported by the apply layer
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub config_values: Values,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub release_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub plugins: Vec<ReleasePlugin>,
    #[serde(default)]
    pub meta_info_params: Option<MetaInfoParams>,
    #[serde(default)]
    pub isomate_config: Option<IsomateConfig>,
}

impl ReleaseSpec {
    pub fn is_paused(&self) -> bool {
        plugin::is_paused(&self.plugins)
    }

    /// Rebuild a request that re-applies this spec unchanged
    pub fn to_request(&self) -> ReleaseRequest {
        ReleaseRequest {
            name: self.name.clone(),
            repo_name: self.repo_name.clone(),
            chart_name: self.chart_name.clone(),
            chart_version: self.chart_version.clone(),
            chart_image: self.chart_image.clone(),
            config_values: self.config_values.clone(),
            dependencies: self.dependencies.clone(),
            release_labels: self.release_labels.clone(),
            plugins: self.plugins.clone(),
            meta_info_params: None,
            isomate_config: self.isomate_config.clone(),
        }
    }
}

/// kind/namespace/name of one object of a release
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceMeta {
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Resource of an object, falling back to `default_namespace`
    pub fn of(object: &K8sObject, default_namespace: &str) -> Self {
        let namespace = object.namespace().unwrap_or(default_namespace);
        Self::new(object.kind(), namespace, object.name())
    }
}

/// Last successful render of a release
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseCache {
    #[serde(flatten)]
    pub spec: ReleaseSpec,

    /// Full values fed to the template engine, plugin list included
    #[serde(default)]
    pub computed_values: Values,

    #[serde(default)]
    pub meta_info_values: Option<MetaInfoParams>,

    #[serde(default)]
    pub dependencies_config_values: Map<String, JsonValue>,

    #[serde(default)]
    pub manifest: String,

    /// sha256 of `manifest`, hex encoded
    #[serde(default)]
    pub manifest_digest: String,

    #[serde(default)]
    pub resources: Vec<ResourceMeta>,

    #[serde(default)]
    pub chart_walm_version: ChartDialect,

    #[serde(default)]
    pub chart_info: ChartInfo,

    /// Raw chart files when the release was installed from files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_files: Option<Vec<ChartFile>>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ReleaseCache {
    pub fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn has_resource(&self, kind: &str, name: &str) -> bool {
        self.resources.iter().any(|r| r.kind == kind && r.name == name)
    }
}

// ========== Tasks ==========

/// Handle of one submitted task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSig {
    pub name: String,
    pub uuid: String,
    #[serde(default)]
    pub timeout_sec: u64,
}

/// Pointer to the latest operation on a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTask {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub latest_task_sig: Option<TaskSig>,
}

/// Pointer to the latest operation on a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectTask {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub latest_task_sig: Option<TaskSig>,
    #[serde(default)]
    pub timeout_sec: u64,
}

// ========== Surfaced release info ==========

/// Status codes surfaced on [`ReleaseInfoV2`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgCode {
    Pending,
    InstallFailed,
    UpgradeFailed,
    DeleteFailed,
    PauseOrRecoverFailed,
    Failed,
    NotReady,
    Paused,
}

impl MsgCode {
    pub fn code(self) -> u32 {
        match self {
            MsgCode::Pending => 1000,
            MsgCode::InstallFailed => 1001,
            MsgCode::UpgradeFailed => 1002,
            MsgCode::DeleteFailed => 1003,
            MsgCode::PauseOrRecoverFailed => 1004,
            MsgCode::Failed => 1100,
            MsgCode::NotReady => 2000,
            MsgCode::Paused => 2001,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1000 => MsgCode::Pending,
            1001 => MsgCode::InstallFailed,
            1002 => MsgCode::UpgradeFailed,
            1003 => MsgCode::DeleteFailed,
            1004 => MsgCode::PauseOrRecoverFailed,
            1100 => MsgCode::Failed,
            2000 => MsgCode::NotReady,
            2001 => MsgCode::Paused,
            _ => return None,
        })
    }
}

impl fmt::Display for MsgCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for MsgCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for MsgCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        MsgCode::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown message code {}", code)))
    }
}

/// Release view returned to callers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfoV2 {
    #[serde(flatten)]
    pub spec: ReleaseSpec,

    #[serde(default)]
    pub computed_values: Values,

    #[serde(default)]
    pub meta_info_values: Option<MetaInfoParams>,

    #[serde(default)]
    pub dependencies_config_values: Map<String, JsonValue>,

    #[serde(default)]
    pub output_config: JsonValue,

    #[serde(default)]
    pub chart_walm_version: ChartDialect,

    #[serde(default)]
    pub resources: Vec<ResourceMeta>,

    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_code: Option<MsgCode>,
}

impl ReleaseInfoV2 {
    /// Info backed by a cached render; readiness is filled in by the caller
    pub fn from_cache(cache: &ReleaseCache) -> Self {
        Self {
            spec: cache.spec.clone(),
            computed_values: cache.computed_values.clone(),
            meta_info_values: cache.meta_info_values.clone(),
            dependencies_config_values: cache.dependencies_config_values.clone(),
            output_config: JsonValue::Null,
            chart_walm_version: cache.chart_walm_version,
            resources: cache.resources.clone(),
            paused: cache.spec.is_paused(),
            ready: false,
            message: String::new(),
            msg_code: None,
        }
    }

    /// Info for a release with a task but no successful render yet
    pub fn placeholder(namespace: &str, name: &str) -> Self {
        Self {
            spec: ReleaseSpec {
                name: name.to_string(),
                namespace: namespace.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dns_label() {
        assert!(validate_dns_label("my-release-1").is_ok());
        assert!(validate_dns_label("").is_err());
        assert!(validate_dns_label("-bad").is_err());
        assert!(validate_dns_label("Upper").is_err());
        assert!(validate_dns_label(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_request_validation() {
        let request = ReleaseRequest::new("web");
        assert!(request.validate(false).unwrap_err().is_invalid_argument());
        assert!(request.validate(true).is_ok());

        let request = ReleaseRequest::new("web").with_chart("stable", "nginx", "1.0.0");
        assert!(request.validate(false).is_ok());

        let dup = request
            .clone()
            .with_plugin(ReleasePlugin::new("LabelPod"))
            .with_plugin(ReleasePlugin::new("LabelPod"));
        assert!(dup.validate(false).is_err());
    }

    #[test]
    fn test_msg_code_serialization() {
        let info = ReleaseInfoV2 {
            msg_code: Some(MsgCode::UpgradeFailed),
            ..ReleaseInfoV2::placeholder("a", "r")
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["msgCode"], json!(1002));
        assert_eq!(json["name"], json!("r"));

        let back: ReleaseInfoV2 = serde_json::from_value(json).unwrap();
        assert_eq!(back.msg_code, Some(MsgCode::UpgradeFailed));
    }

    #[test]
    fn test_cache_round_trip_json() {
        let cache = ReleaseCache {
            spec: ReleaseSpec {
                name: "r".into(),
                namespace: "a".into(),
                plugins: plugin::finalize_plugins(vec![], Some(true)),
                ..Default::default()
            },
            resources: vec![ResourceMeta::new("Deployment", "a", "r")],
            ..Default::default()
        };
        let blob = serde_json::to_vec(&cache).unwrap();
        let back: ReleaseCache = serde_json::from_slice(&blob).unwrap();
        assert_eq!(back, cache);
        assert!(back.spec.is_paused());
        assert!(back.has_resource("Deployment", "r"));
    }
}
