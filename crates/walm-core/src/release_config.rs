//! The cluster-side `ReleaseConfig` custom resource
//!
//! The core writes one per release (through the apply path) and reads them
//! back to resolve dependencies and to list releases by label.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::chart::ChartDialect;
use crate::error::Result;
use crate::object::{K8sObject, kinds};
use crate::release::AUTO_GEN_LABEL;

pub const RELEASE_CONFIG_API_VERSION: &str = "apiextensions.transwarp.io/v1beta1";
pub const RELEASE_CONFIG_GROUP: &str = "apiextensions.transwarp.io";
pub const RELEASE_CONFIG_VERSION: &str = "v1beta1";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseConfigSpec {
    #[serde(default)]
    pub config_values: Map<String, JsonValue>,

    #[serde(default)]
    pub dependencies_config_values: Map<String, JsonValue>,

    /// Produced config advertised to dependents; users may edit it
    #[serde(default)]
    pub output_config: Map<String, JsonValue>,

    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    #[serde(default)]
    pub repo: String,

    #[serde(default)]
    pub chart_name: String,

    #[serde(default)]
    pub chart_version: String,

    #[serde(default)]
    pub chart_app_version: String,

    #[serde(default)]
    pub chart_image: String,

    #[serde(default)]
    pub chart_walm_version: ChartDialect,
}

/// A ReleaseConfig with the metadata the core cares about
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleaseConfig {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub spec: ReleaseConfigSpec,
}

impl ReleaseConfig {
    pub fn is_auto_gen(&self) -> bool {
        self.labels.get(AUTO_GEN_LABEL).is_some_and(|v| v == "true")
    }

    /// Build the object form that is appended to the rendered manifest
    pub fn to_object(&self) -> Result<K8sObject> {
        let mut object = K8sObject::new(RELEASE_CONFIG_API_VERSION, kinds::RELEASE_CONFIG, &self.name);
        object.set_namespace(&self.namespace);
        for (k, v) in &self.labels {
            object.set_label(k, v);
        }
        object.set(&["spec"], serde_json::to_value(&self.spec)?);
        Ok(object)
    }

    /// Decode from a generic object; unknown spec fields are ignored
    pub fn from_object(object: &K8sObject) -> Result<Self> {
        let spec = match object.get(&["spec"]) {
            Some(spec) => serde_json::from_value(spec.clone())?,
            None => ReleaseConfigSpec::default(),
        };
        let labels = object
            .labels()
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect();
        Ok(Self {
            name: object.name().to_string(),
            namespace: object.namespace().unwrap_or_default().to_string(),
            labels,
            spec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_round_trip() {
        let mut rc = ReleaseConfig {
            name: "r".into(),
            namespace: "a".into(),
            ..Default::default()
        };
        rc.labels.insert(AUTO_GEN_LABEL.into(), "true".into());
        rc.spec.output_config.insert("port".into(), json!(8080));
        rc.spec.chart_walm_version = ChartDialect::V1;

        let object = rc.to_object().unwrap();
        assert_eq!(object.kind(), "ReleaseConfig");
        assert_eq!(object.api_version(), RELEASE_CONFIG_API_VERSION);
        assert_eq!(object.get(&["spec", "chartWalmVersion"]).unwrap(), "v1");

        let back = ReleaseConfig::from_object(&object).unwrap();
        assert_eq!(back, rc);
        assert!(back.is_auto_gen());
    }
}
