//! Chart meta-info (`transwarp-meta/metainfo.yaml`) and its value projections
//!
//! The meta-info declares, for a chart, which values map-keys carry role
//! settings (image, replicas, resources...) and which carry free parameters.
//! [`ChartMetaInfo::project_params`] turns structured [`MetaInfoParams`] into
//! a values tree; [`ChartMetaInfo::extract_params`] is the inverse and only
//! reports what the meta-info declares.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoreError, Result};
use crate::plugin::ReleasePlugin;
use crate::values::Values;

/// Path of the meta-info side-car inside a chart
pub const METAINFO_PATH: &str = "transwarp-meta/metainfo.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetaInfo {
    #[serde(default)]
    pub friendly_name: String,

    #[serde(default)]
    pub categories: Vec<String>,

    #[serde(default, alias = "dependencies")]
    pub chart_dependencies_info: Vec<ChartDependencyInfo>,

    #[serde(default, alias = "roles")]
    pub chart_roles: Vec<MetaRoleConfig>,

    #[serde(default, alias = "params")]
    pub chart_params: Vec<MetaCommonConfig>,

    #[serde(default)]
    pub plugins: Vec<ReleasePlugin>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartDependencyInfo {
    /// Dependency alias used as key of a release's `dependencies` map
    pub name: String,

    #[serde(default)]
    pub chart_name: String,

    #[serde(default)]
    pub min_version: String,

    #[serde(default)]
    pub max_version: String,

    /// Values key receiving the upstream's output config
    #[serde(default)]
    pub alias_config_var: String,

    #[serde(default, alias = "dependencyOptional")]
    pub optional: bool,
}

impl ChartDependencyInfo {
    /// Values key the resolved output config is written under
    pub fn config_var(&self) -> &str {
        if self.alias_config_var.is_empty() {
            &self.name
        } else {
            &self.alias_config_var
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetaConfigType {
    Boolean,
    Int,
    Float,
    #[default]
    String,
    Text,
    Yaml,
    Json,
    KvPair,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableType {
    #[default]
    AdvanceConfig,
    TranswarpBundleConfig,
}

/// A named map-key declared by the meta-info
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaConfig {
    pub map_key: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaCommonConfig {
    pub name: String,

    pub map_key: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, rename = "type")]
    pub config_type: MetaConfigType,

    #[serde(default)]
    pub variable_type: VariableType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRoleConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, alias = "baseConfig")]
    pub role_base_config: Option<MetaRoleBaseConfig>,

    #[serde(default, alias = "resources")]
    pub role_resource_config: Option<MetaResourceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRoleBaseConfig {
    #[serde(default)]
    pub image: Option<MetaConfig>,
    #[serde(default)]
    pub replicas: Option<MetaConfig>,
    #[serde(default)]
    pub priority: Option<MetaConfig>,
    #[serde(default)]
    pub env: Option<MetaConfig>,
    #[serde(default)]
    pub env_map: Option<MetaConfig>,
    #[serde(default)]
    pub use_host_network: Option<MetaConfig>,
    #[serde(default)]
    pub others: Vec<MetaCommonConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaResourceConfig {
    #[serde(default)]
    pub limits_memory: Option<MetaConfig>,
    #[serde(default)]
    pub limits_cpu: Option<MetaConfig>,
    #[serde(default)]
    pub limits_gpu: Option<MetaConfig>,
    #[serde(default)]
    pub requests_memory: Option<MetaConfig>,
    #[serde(default)]
    pub requests_cpu: Option<MetaConfig>,
    #[serde(default)]
    pub requests_gpu: Option<MetaConfig>,
    #[serde(default, alias = "storageResources")]
    pub storage_resource_config: Vec<MetaStorageConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaStorageConfig {
    pub name: String,
    pub map_key: String,
    #[serde(default)]
    pub description: String,
}

// ========== Structured parameters ==========

/// Structured, UI-friendly form of a release's configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaInfoParams {
    #[serde(default)]
    pub roles: Vec<MetaRoleConfigValue>,

    #[serde(default)]
    pub params: Vec<MetaCommonConfigValue>,
}

impl MetaInfoParams {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.params.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRoleConfigValue {
    pub name: String,

    #[serde(default, alias = "baseConfig")]
    pub role_base_config_value: Option<MetaRoleBaseConfigValue>,

    #[serde(default, alias = "resources")]
    pub role_resource_config_value: Option<MetaResourceConfigValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRoleBaseConfigValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<MetaEnv>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_map: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_host_network: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub others: Vec<MetaCommonConfigValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEnv {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Resource settings: memory in MiB, cpu in cores, gpu in units
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaResourceConfigValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits_memory: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits_cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits_gpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_memory: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_gpu: Option<f64>,
    #[serde(default, alias = "storageResources", skip_serializing_if = "Vec::is_empty")]
    pub storage_resource_config_value: Vec<MetaStorageConfigValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaStorageConfigValue {
    pub name: String,
    pub value: MetaStorage,
}

/// Storage request: size in GiB
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaStorage {
    #[serde(default)]
    pub access_modes: Vec<String>,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaCommonConfigValue {
    pub name: String,

    #[serde(default, rename = "type")]
    pub config_type: MetaConfigType,

    /// String-encoded value, decoded according to the declared type
    #[serde(default)]
    pub value: String,
}

impl ChartMetaInfo {
    /// Parse from the YAML side-car
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn dependency(&self, alias: &str) -> Option<&ChartDependencyInfo> {
        self.chart_dependencies_info.iter().find(|d| d.name == alias)
    }

    fn role(&self, name: &str) -> Option<&MetaRoleConfig> {
        self.chart_roles.iter().find(|r| r.name == name)
    }

    fn param(&self, name: &str) -> Option<&MetaCommonConfig> {
        self.chart_params.iter().find(|p| p.name == name)
    }

    /// Every dependency alias must be declared by the meta-info
    pub fn validate_dependency_aliases<'a>(
        &self,
        aliases: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        for alias in aliases {
            if self.dependency(alias).is_none() {
                return Err(CoreError::invalid(format!(
                    "dependency alias '{}' is not declared by chart meta-info",
                    alias
                )));
            }
        }
        Ok(())
    }

    /// Every map-key declared anywhere in the meta-info
    pub fn declared_map_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for role in &self.chart_roles {
            if let Some(base) = &role.role_base_config {
                for config in [
                    &base.image,
                    &base.replicas,
                    &base.priority,
                    &base.env,
                    &base.env_map,
                    &base.use_host_network,
                ]
                .into_iter()
                .flatten()
                {
                    keys.insert(config.map_key.clone());
                }
                keys.extend(base.others.iter().map(|o| o.map_key.clone()));
            }
            if let Some(resources) = &role.role_resource_config {
                for config in resources.scalar_configs().into_iter().flatten() {
                    keys.insert(config.map_key.clone());
                }
                keys.extend(
                    resources
                        .storage_resource_config
                        .iter()
                        .map(|s| s.map_key.clone()),
                );
            }
        }
        keys.extend(self.chart_params.iter().map(|p| p.map_key.clone()));
        keys
    }

    /// Project structured parameters onto a values tree
    ///
    /// Fails when a parameter names a role, field or param the meta-info does
    /// not declare.
    pub fn project_params(&self, params: &MetaInfoParams) -> Result<Values> {
        let mut values = Values::new();

        for role_value in &params.roles {
            let role = self.role(&role_value.name).ok_or_else(|| {
                CoreError::invalid(format!("role '{}' is not declared", role_value.name))
            })?;

            if let Some(base_value) = &role_value.role_base_config_value {
                let base = role.role_base_config.as_ref().ok_or_else(|| {
                    CoreError::invalid(format!("role '{}' declares no base config", role.name))
                })?;
                project_base(&mut values, &role.name, base, base_value)?;
            }

            if let Some(resource_value) = &role_value.role_resource_config_value {
                let resources = role.role_resource_config.as_ref().ok_or_else(|| {
                    CoreError::invalid(format!(
                        "role '{}' declares no resource config",
                        role.name
                    ))
                })?;
                project_resources(&mut values, &role.name, resources, resource_value)?;
            }
        }

        for param_value in &params.params {
            let param = self.param(&param_value.name).ok_or_else(|| {
                CoreError::invalid(format!("param '{}' is not declared", param_value.name))
            })?;
            values.set(
                &param.map_key,
                decode_typed(param.config_type, &param_value.value)?,
            )?;
        }

        Ok(values)
    }

    /// Read structured parameters back out of a values tree
    ///
    /// Only map-keys declared by the meta-info are inspected; roles and
    /// params with no value present are omitted.
    pub fn extract_params(&self, values: &Values) -> MetaInfoParams {
        let mut params = MetaInfoParams::default();

        for role in &self.chart_roles {
            let base = role
                .role_base_config
                .as_ref()
                .and_then(|b| extract_base(values, b));
            let resources = role
                .role_resource_config
                .as_ref()
                .and_then(|r| extract_resources(values, r));
            if base.is_some() || resources.is_some() {
                params.roles.push(MetaRoleConfigValue {
                    name: role.name.clone(),
                    role_base_config_value: base,
                    role_resource_config_value: resources,
                });
            }
        }

        for param in &self.chart_params {
            if let Some(value) = values.get(&param.map_key) {
                params.params.push(MetaCommonConfigValue {
                    name: param.name.clone(),
                    config_type: param.config_type,
                    value: encode_typed(param.config_type, value),
                });
            }
        }

        params
    }
}

impl MetaResourceConfig {
    fn scalar_configs(&self) -> [&Option<MetaConfig>; 6] {
        [
            &self.limits_memory,
            &self.limits_cpu,
            &self.limits_gpu,
            &self.requests_memory,
            &self.requests_cpu,
            &self.requests_gpu,
        ]
    }
}

fn require_key<'a>(config: &'a Option<MetaConfig>, role: &str, field: &str) -> Result<&'a str> {
    config
        .as_ref()
        .map(|c| c.map_key.as_str())
        .ok_or_else(|| CoreError::invalid(format!("role '{}' does not declare {}", role, field)))
}

fn project_base(
    values: &mut Values,
    role: &str,
    base: &MetaRoleBaseConfig,
    value: &MetaRoleBaseConfigValue,
) -> Result<()> {
    if let Some(image) = &value.image {
        values.set(require_key(&base.image, role, "image")?, JsonValue::from(image.as_str()))?;
    }
    if let Some(replicas) = value.replicas {
        values.set(require_key(&base.replicas, role, "replicas")?, JsonValue::from(replicas))?;
    }
    if let Some(priority) = value.priority {
        values.set(require_key(&base.priority, role, "priority")?, JsonValue::from(priority))?;
    }
    if let Some(env) = &value.env {
        values.set(require_key(&base.env, role, "env")?, serde_json::to_value(env)?)?;
    }
    if let Some(env_map) = &value.env_map {
        values.set(require_key(&base.env_map, role, "envMap")?, serde_json::to_value(env_map)?)?;
    }
    if let Some(host_network) = value.use_host_network {
        values.set(
            require_key(&base.use_host_network, role, "useHostNetwork")?,
            JsonValue::Bool(host_network),
        )?;
    }
    for other in &value.others {
        let declared = base.others.iter().find(|o| o.name == other.name).ok_or_else(|| {
            CoreError::invalid(format!("role '{}' does not declare '{}'", role, other.name))
        })?;
        values.set(&declared.map_key, decode_typed(declared.config_type, &other.value)?)?;
    }
    Ok(())
}

fn project_resources(
    values: &mut Values,
    role: &str,
    config: &MetaResourceConfig,
    value: &MetaResourceConfigValue,
) -> Result<()> {
    let memory = [
        (&config.limits_memory, value.limits_memory, "limitsMemory"),
        (&config.requests_memory, value.requests_memory, "requestsMemory"),
    ];
    for (meta, amount, field) in memory {
        if let Some(amount) = amount {
            values.set(require_key(meta, role, field)?, JsonValue::from(format!("{}Mi", amount)))?;
        }
    }

    let numeric = [
        (&config.limits_cpu, value.limits_cpu, "limitsCpu"),
        (&config.limits_gpu, value.limits_gpu, "limitsGpu"),
        (&config.requests_cpu, value.requests_cpu, "requestsCpu"),
        (&config.requests_gpu, value.requests_gpu, "requestsGpu"),
    ];
    for (meta, amount, field) in numeric {
        if let Some(amount) = amount {
            values.set(require_key(meta, role, field)?, float_value(amount))?;
        }
    }

    for storage in &value.storage_resource_config_value {
        let declared = config
            .storage_resource_config
            .iter()
            .find(|s| s.name == storage.name)
            .ok_or_else(|| {
                CoreError::invalid(format!(
                    "role '{}' does not declare storage '{}'",
                    role, storage.name
                ))
            })?;
        let mut object = Map::new();
        object.insert(
            "accessModes".to_string(),
            serde_json::to_value(&storage.value.access_modes)?,
        );
        object.insert(
            "storageClass".to_string(),
            JsonValue::from(storage.value.storage_class.as_str()),
        );
        object.insert(
            "size".to_string(),
            JsonValue::from(format!("{}Gi", storage.value.size)),
        );
        values.set(&declared.map_key, JsonValue::Object(object))?;
    }
    Ok(())
}

fn extract_base(values: &Values, base: &MetaRoleBaseConfig) -> Option<MetaRoleBaseConfigValue> {
    let lookup = |config: &Option<MetaConfig>| {
        config.as_ref().and_then(|c| values.get(&c.map_key)).cloned()
    };

    let result = MetaRoleBaseConfigValue {
        image: lookup(&base.image).and_then(|v| v.as_str().map(str::to_string)),
        replicas: lookup(&base.replicas).and_then(|v| as_i64(&v)),
        priority: lookup(&base.priority).and_then(|v| as_i64(&v)),
        env: lookup(&base.env).and_then(|v| serde_json::from_value(v).ok()),
        env_map: lookup(&base.env_map).and_then(|v| serde_json::from_value(v).ok()),
        use_host_network: lookup(&base.use_host_network).and_then(|v| v.as_bool()),
        others: base
            .others
            .iter()
            .filter_map(|o| {
                values.get(&o.map_key).map(|v| MetaCommonConfigValue {
                    name: o.name.clone(),
                    config_type: o.config_type,
                    value: encode_typed(o.config_type, v),
                })
            })
            .collect(),
    };

    (result != MetaRoleBaseConfigValue::default()).then_some(result)
}

fn extract_resources(
    values: &Values,
    config: &MetaResourceConfig,
) -> Option<MetaResourceConfigValue> {
    let lookup = |meta: &Option<MetaConfig>| meta.as_ref().and_then(|c| values.get(&c.map_key));

    let result = MetaResourceConfigValue {
        limits_memory: lookup(&config.limits_memory).and_then(parse_memory_mi),
        limits_cpu: lookup(&config.limits_cpu).and_then(parse_cpu),
        limits_gpu: lookup(&config.limits_gpu).and_then(parse_cpu),
        requests_memory: lookup(&config.requests_memory).and_then(parse_memory_mi),
        requests_cpu: lookup(&config.requests_cpu).and_then(parse_cpu),
        requests_gpu: lookup(&config.requests_gpu).and_then(parse_cpu),
        storage_resource_config_value: config
            .storage_resource_config
            .iter()
            .filter_map(|s| {
                let object = values.get(&s.map_key)?.as_object()?;
                Some(MetaStorageConfigValue {
                    name: s.name.clone(),
                    value: MetaStorage {
                        access_modes: object
                            .get("accessModes")
                            .and_then(|v| serde_json::from_value(v.clone()).ok())
                            .unwrap_or_default(),
                        storage_class: object
                            .get("storageClass")
                            .and_then(JsonValue::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        size: object.get("size").and_then(parse_storage_gi).unwrap_or(0),
                    },
                })
            })
            .collect(),
    };

    (result != MetaResourceConfigValue::default()).then_some(result)
}

fn as_i64(value: &JsonValue) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn float_value(amount: f64) -> JsonValue {
    serde_json::Number::from_f64(amount)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Memory quantity in MiB (`512Mi`, `2Gi`, or a bare number of MiB)
pub fn parse_memory_mi(value: &JsonValue) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let s = value.as_str()?.trim();
    let (digits, factor) = if let Some(n) = s.strip_suffix("Gi") {
        (n, 1024.0)
    } else if let Some(n) = s.strip_suffix("Mi") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix("Ki") {
        (n, 1.0 / 1024.0)
    } else {
        (s, 1.0)
    };
    digits.parse::<f64>().ok().map(|n| (n * factor).round() as i64)
}

/// Cpu quantity in cores (`500m`, `0.5`, `2`)
pub fn parse_cpu(value: &JsonValue) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    let s = value.as_str()?.trim();
    match s.strip_suffix('m') {
        Some(milli) => milli.parse::<f64>().ok().map(|m| m / 1000.0),
        None => s.parse().ok(),
    }
}

/// Storage quantity in GiB (`100Gi`, `1Ti`, `512Mi` rounds up)
pub fn parse_storage_gi(value: &JsonValue) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let s = value.as_str()?.trim();
    if let Some(n) = s.strip_suffix("Ti") {
        return n.parse::<i64>().ok().map(|n| n * 1024);
    }
    if let Some(n) = s.strip_suffix("Gi") {
        return n.parse().ok();
    }
    if let Some(n) = s.strip_suffix("Mi") {
        return n.parse::<i64>().ok().map(|n| (n + 1023) / 1024);
    }
    s.parse().ok()
}

/// Decode a string-encoded parameter according to its declared type
pub fn decode_typed(config_type: MetaConfigType, raw: &str) -> Result<JsonValue> {
    let invalid = |what: &str| {
        CoreError::invalid(format!("value '{}' is not a valid {}", raw, what))
    };
    Ok(match config_type {
        MetaConfigType::Boolean => JsonValue::Bool(raw.trim().parse().map_err(|_| invalid("boolean"))?),
        MetaConfigType::Int => JsonValue::from(raw.trim().parse::<i64>().map_err(|_| invalid("int"))?),
        MetaConfigType::Float => {
            float_value(raw.trim().parse::<f64>().map_err(|_| invalid("float"))?)
        }
        MetaConfigType::String | MetaConfigType::Text => JsonValue::from(raw),
        MetaConfigType::Yaml => serde_yaml::from_str(raw)?,
        MetaConfigType::Json | MetaConfigType::KvPair => serde_json::from_str(raw)?,
    })
}

/// Encode a values-tree entry back into its string form
pub fn encode_typed(config_type: MetaConfigType, value: &JsonValue) -> String {
    match (config_type, value) {
        (_, JsonValue::String(s)) if !matches!(config_type, MetaConfigType::Json | MetaConfigType::KvPair) => {
            s.clone()
        }
        (MetaConfigType::Yaml, v) => serde_yaml::to_string(v)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
        (_, v) => v.to_string(),
    }
}
