//! Values tree with deep merge and dotted-path access
//!
//! A single recursive JSON tree is shared by the chart processor, the
//! dependency resolver and the plugins. Two merge flavours exist:
//! - [`Values::merge`]: overlay wins, nulls are copied verbatim
//! - [`Values::merge_delete_nulls`]: overlay wins, a null in the overlay
//!   removes the key from the base (used when reusing old release values)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{CoreError, Result};

/// Values container with deep merge capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Default for Values {
    fn default() -> Self {
        Self::new()
    }
}

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(Map::new()))
    }

    /// Parse values from YAML string; an empty document yields empty values
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::new());
        }
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Ok(Self::from_json_value(value))
    }

    /// Parse values from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Ok(Self::from_json_value(value))
    }

    /// Wrap a JSON value, normalising `null` to an empty map
    pub fn from_json_value(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::new(),
            other => Self(other),
        }
    }

    /// Deep merge another Values into this one
    ///
    /// Scalars and arrays in the overlay replace the base; objects merge
    /// recursively.
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0, false);
    }

    /// Deep merge where a `null` in the overlay deletes the key from the base
    pub fn merge_delete_nulls(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0, true);
    }

    /// Set a value by dotted path (e.g., "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) -> Result<()> {
        let parts = split_path(path)?;
        set_nested(&mut self.0, &parts, value);
        Ok(())
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
        get_nested(&self.0, &parts)
    }

    /// Remove a value by dotted path, returning what was there
    pub fn remove(&mut self, path: &str) -> Option<JsonValue> {
        let parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
        let (last, parents) = parts.split_last()?;
        let mut current = &mut self.0;
        for key in parents {
            current = current.as_object_mut()?.get_mut(*key)?;
        }
        current.as_object_mut()?.remove(*last)
    }

    /// Insert a top-level key, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) {
        if !self.0.is_object() {
            self.0 = JsonValue::Object(Map::new());
        }
        if let JsonValue::Object(map) = &mut self.0 {
            map.insert(key.into(), value);
        }
    }

    /// Top-level map view, if the tree is an object
    pub fn as_map(&self) -> Option<&Map<String, JsonValue>> {
        self.0.as_object()
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Convert to JSON value
    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// Serialize as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.0)?)
    }
}

impl From<JsonValue> for Values {
    fn from(value: JsonValue) -> Self {
        Self::from_json_value(value)
    }
}

impl From<Map<String, JsonValue>> for Values {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(JsonValue::Object(map))
    }
}

/// Reuse old values on update: keys of `new` override `old`, keys absent
/// from `new` persist, and a `null` in `new` deletes the key.
pub fn reuse_values(old: &Values, new: &Values) -> Values {
    let mut merged = old.clone();
    merged.merge_delete_nulls(new);
    merged
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(CoreError::Values {
            message: format!("invalid values path '{}'", path),
        });
    }
    Ok(parts)
}

/// Deep merge two JSON values
fn deep_merge(base: &mut JsonValue, overlay: &JsonValue, delete_nulls: bool) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                if delete_nulls && overlay_value.is_null() {
                    base_map.remove(key);
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value, delete_nulls),
                    None => {
                        let mut value = overlay_value.clone();
                        if delete_nulls {
                            strip_nulls(&mut value);
                        }
                        base_map.insert(key.clone(), value);
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
            if delete_nulls {
                strip_nulls(base);
            }
        }
    }
}

fn strip_nulls(value: &mut JsonValue) {
    if let JsonValue::Object(map) = value {
        map.retain(|_, v| !v.is_null());
        for v in map.values_mut() {
            strip_nulls(v);
        }
    }
}

/// Set a nested value by path
fn set_nested(value: &mut JsonValue, path: &[&str], new_value: JsonValue) {
    let Some((key, remaining)) = path.split_first() else {
        *value = new_value;
        return;
    };

    if !value.is_object() {
        *value = JsonValue::Object(Map::new());
    }

    if let JsonValue::Object(map) = value {
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if remaining.is_empty() {
            *entry = new_value;
        } else {
            set_nested(entry, remaining, new_value);
        }
    }
}

/// Get a nested value by path
fn get_nested<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let Some((key, remaining)) = path.split_first() else {
        return Some(value);
    };

    match value {
        JsonValue::Object(map) => map.get(*key).and_then(|v| get_nested(v, remaining)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge() {
        let mut base = Values::from_yaml(
            r#"
image:
  repository: nginx
  tag: "1.0"
replicas: 1
"#,
        )
        .unwrap();

        let overlay = Values::from_yaml(
            r#"
image:
  tag: "2.0"
  pullPolicy: Always
replicas: 3
"#,
        )
        .unwrap();

        base.merge(&overlay);

        assert_eq!(base.get("image.repository").unwrap(), "nginx");
        assert_eq!(base.get("image.tag").unwrap(), "2.0");
        assert_eq!(base.get("image.pullPolicy").unwrap(), "Always");
        assert_eq!(base.get("replicas").unwrap(), 3);
    }

    #[test]
    fn test_plain_merge_keeps_nulls() {
        let mut base = Values(json!({"a": 1}));
        base.merge(&Values(json!({"a": null})));
        assert_eq!(base.get("a"), Some(&JsonValue::Null));
    }

    #[test]
    fn test_reuse_overrides_persists_and_deletes() {
        let old = Values(json!({
            "replicas": 1,
            "image": {"tag": "1.0", "repository": "nginx"},
            "debug": true,
        }));
        let new = Values(json!({
            "replicas": 3,
            "image": {"tag": null},
            "debug": null,
            "extra": {"keep": 1, "drop": null},
        }));

        let merged = reuse_values(&old, &new);

        assert_eq!(merged.get("replicas").unwrap(), 3);
        assert_eq!(merged.get("image.repository").unwrap(), "nginx");
        assert!(merged.get("image.tag").is_none());
        assert!(merged.get("debug").is_none());
        assert_eq!(merged.get("extra.keep").unwrap(), 1);
        assert!(merged.get("extra.drop").is_none());
    }

    #[test]
    fn test_reuse_with_empty_new_is_identity() {
        let old = Values(json!({"a": {"b": [1, 2]}}));
        assert_eq!(reuse_values(&old, &Values::new()), old);
    }

    #[test]
    fn test_set_and_remove_nested() {
        let mut values = Values::new();
        values.set("image.tag", json!("v1")).unwrap();
        values.set("replicas", json!(3)).unwrap();

        assert_eq!(values.get("image.tag").unwrap(), "v1");
        assert_eq!(values.remove("image.tag"), Some(json!("v1")));
        assert!(values.get("image.tag").is_none());
        assert!(values.get("image").is_some());
    }

    #[test]
    fn test_set_rejects_empty_segment() {
        let mut values = Values::new();
        assert!(values.set("a..b", json!(1)).is_err());
    }

    #[test]
    fn test_empty_yaml_is_empty_map() {
        let values = Values::from_yaml("   \n").unwrap();
        assert!(values.is_empty());
        assert!(values.as_map().is_some());
    }
}
