//! Generic Kubernetes objects
//!
//! Plugins rewrite rendered objects without a typed model per kind: a
//! [`K8sObject`] wraps the raw JSON tree, keeps unknown fields intact, and
//! offers path helpers that create intermediate maps on demand.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{CoreError, Result};

/// Kinds the core inspects or rewrites
pub mod kinds {
    pub const DEPLOYMENT: &str = "Deployment";
    pub const STATEFUL_SET: &str = "StatefulSet";
    pub const DAEMON_SET: &str = "DaemonSet";
    pub const JOB: &str = "Job";
    pub const CONFIG_MAP: &str = "ConfigMap";
    pub const INGRESS: &str = "Ingress";
    pub const SERVICE: &str = "Service";
    pub const SECRET: &str = "Secret";
    pub const POD: &str = "Pod";
    pub const PERSISTENT_VOLUME_CLAIM: &str = "PersistentVolumeClaim";
    pub const RELEASE_CONFIG: &str = "ReleaseConfig";
    pub const ISOMATE_SET: &str = "IsomateSet";

    /// Kinds carrying a pod template at `spec.template`
    pub const WORKLOADS: [&str; 4] = [DEPLOYMENT, STATEFUL_SET, DAEMON_SET, JOB];
}

/// One Kubernetes object as a JSON map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sObject(Map<String, JsonValue>);

impl K8sObject {
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        let mut object = Map::new();
        object.insert("apiVersion".into(), JsonValue::from(api_version));
        object.insert("kind".into(), JsonValue::from(kind));
        let mut metadata = Map::new();
        metadata.insert("name".into(), JsonValue::from(name));
        object.insert("metadata".into(), JsonValue::Object(metadata));
        Self(object)
    }

    /// Wrap a decoded document; it must be a map with a string `kind`
    pub fn from_value(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(map) if map.get("kind").is_some_and(JsonValue::is_string) => {
                Ok(Self(map))
            }
            other => Err(CoreError::InvalidManifest {
                message: format!("object has no kind: {}", truncate(&other.to_string())),
            }),
        }
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(JsonValue::as_str).unwrap_or_default()
    }

    pub fn api_version(&self) -> &str {
        self.0
            .get("apiVersion")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
    }

    pub fn set_api_version(&mut self, api_version: &str) {
        self.0.insert("apiVersion".into(), JsonValue::from(api_version));
    }

    pub fn set_kind(&mut self, kind: &str) {
        self.0.insert("kind".into(), JsonValue::from(kind));
    }

    pub fn name(&self) -> &str {
        self.get(&["metadata", "name"])
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
    }

    pub fn set_name(&mut self, name: &str) {
        self.metadata_mut().insert("name".into(), JsonValue::from(name));
    }

    pub fn namespace(&self) -> Option<&str> {
        self.get(&["metadata", "namespace"])
            .and_then(JsonValue::as_str)
            .filter(|ns| !ns.is_empty())
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".into(), JsonValue::from(namespace));
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind() == kind
    }

    pub fn is_workload(&self) -> bool {
        kinds::WORKLOADS.contains(&self.kind())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.get(&["metadata", "labels", key])
            .and_then(JsonValue::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.get(&["metadata", "annotations", key])
            .and_then(JsonValue::as_str)
    }

    /// True when the annotation is present and equals `true`
    pub fn has_flag_annotation(&self, key: &str) -> bool {
        self.annotation(key)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn labels(&self) -> Map<String, JsonValue> {
        self.get(&["metadata", "labels"])
            .and_then(JsonValue::as_object)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.ensure_object(&["metadata", "labels"])
            .insert(key.to_string(), JsonValue::from(value));
    }

    pub fn remove_label(&mut self, key: &str) -> Option<JsonValue> {
        self.get_mut(&["metadata", "labels"])
            .and_then(JsonValue::as_object_mut)
            .and_then(|labels| labels.remove(key))
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.ensure_object(&["metadata", "annotations"])
            .insert(key.to_string(), JsonValue::from(value));
    }

    pub fn remove_annotation(&mut self, key: &str) -> Option<JsonValue> {
        self.get_mut(&["metadata", "annotations"])
            .and_then(JsonValue::as_object_mut)
            .and_then(|annotations| annotations.remove(key))
    }

    pub fn metadata_mut(&mut self) -> &mut Map<String, JsonValue> {
        self.ensure_object(&["metadata"])
    }

    /// Read a nested field
    pub fn get(&self, path: &[&str]) -> Option<&JsonValue> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(*first)?;
        for key in rest {
            current = current.as_object()?.get(*key)?;
        }
        Some(current)
    }

    pub fn get_mut(&mut self, path: &[&str]) -> Option<&mut JsonValue> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get_mut(*first)?;
        for key in rest {
            current = current.as_object_mut()?.get_mut(*key)?;
        }
        Some(current)
    }

    /// Replace a nested field, creating parent maps as needed
    pub fn set(&mut self, path: &[&str], value: JsonValue) {
        if let Some((last, parents)) = path.split_last() {
            self.ensure_object(parents).insert(last.to_string(), value);
        }
    }

    /// Map at `path`, created (or replacing a non-map) when missing
    pub fn ensure_object(&mut self, path: &[&str]) -> &mut Map<String, JsonValue> {
        let mut current = &mut self.0;
        for key in path {
            let entry = current
                .entry(key.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if !entry.is_object() {
                *entry = JsonValue::Object(Map::new());
            }
            current = match entry {
                JsonValue::Object(map) => map,
                _ => unreachable!("entry was just made an object"),
            };
        }
        current
    }

    /// Array under `key` of the map at `parents`, created (or replacing a
    /// non-array) when missing
    pub fn ensure_array(&mut self, parents: &[&str], key: &str) -> &mut Vec<JsonValue> {
        let parent = self.ensure_object(parents);
        let entry = parent
            .entry(key.to_string())
            .or_insert_with(|| JsonValue::Array(Vec::new()));
        if !entry.is_array() {
            *entry = JsonValue::Array(Vec::new());
        }
        match entry {
            JsonValue::Array(items) => items,
            _ => unreachable!("entry was just made an array"),
        }
    }

    /// `spec.replicas`, if set
    pub fn replicas(&self) -> Option<i64> {
        self.get(&["spec", "replicas"]).and_then(JsonValue::as_i64)
    }

    pub fn set_replicas(&mut self, replicas: i64) {
        self.set(&["spec", "replicas"], JsonValue::from(replicas));
    }

    /// Pod spec of a workload (`spec.template.spec`), created when missing
    pub fn pod_spec_mut(&mut self) -> Option<&mut Map<String, JsonValue>> {
        if !self.is_workload() {
            return None;
        }
        Some(self.ensure_object(&["spec", "template", "spec"]))
    }

    /// Mutable views of every container in the pod template
    pub fn containers_mut(&mut self) -> Vec<&mut Map<String, JsonValue>> {
        let Some(pod_spec) = self.pod_spec_mut() else {
            return Vec::new();
        };
        match pod_spec.get_mut("containers") {
            Some(JsonValue::Array(containers)) => containers
                .iter_mut()
                .filter_map(JsonValue::as_object_mut)
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn truncate(s: &str) -> String {
    if s.len() > 80 {
        let mut end = 80;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    } else {
        s.to_string()
    }
}

/// Split a multi-document manifest into objects
///
/// Empty and comment-only documents are skipped; `List` kinds are flattened.
pub fn parse_manifest(manifest: &str) -> Result<Vec<K8sObject>> {
    let mut objects = Vec::new();
    let mut current = String::new();

    let flush = |doc: &mut String, objects: &mut Vec<K8sObject>| -> Result<()> {
        let meaningful = doc
            .lines()
            .any(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'));
        if meaningful {
            let value: JsonValue = serde_yaml::from_str(doc)?;
            push_document(value, objects)?;
        }
        doc.clear();
        Ok(())
    };

    for line in manifest.lines() {
        if line.starts_with("---") {
            flush(&mut current, &mut objects)?;
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    flush(&mut current, &mut objects)?;

    Ok(objects)
}

fn push_document(value: JsonValue, objects: &mut Vec<K8sObject>) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    let object = K8sObject::from_value(value)?;
    if object.kind() == "List" {
        let items = object
            .as_map()
            .get("items")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        for item in items {
            push_document(item, objects)?;
        }
    } else {
        objects.push(object);
    }
    Ok(())
}

/// Serialize objects back into a multi-document manifest
pub fn to_manifest(objects: &[K8sObject]) -> Result<String> {
    let mut out = String::new();
    for object in objects {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(object)?);
    }
    Ok(out)
}

/// Run `f` on every object whose kind is in `kinds`
pub fn for_each_kind<F>(objects: &mut [K8sObject], kinds: &[&str], mut f: F) -> Result<()>
where
    F: FnMut(&mut K8sObject) -> Result<()>,
{
    for object in objects.iter_mut().filter(|o| kinds.contains(&o.kind())) {
        f(object)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MANIFEST: &str = r#"
# Source: demo/templates/cm.yaml
apiVersion: v1
kind: ConfigMap
metadata:
  name: demo
  customField: kept
data:
  a: "1"
---
# comment only
---
apiVersion: v1
kind: List
items:
  - apiVersion: apps/v1
    kind: Deployment
    metadata:
      name: web
    spec:
      replicas: 2
      template:
        spec:
          containers:
            - name: app
              image: nginx
"#;

    #[test]
    fn test_parse_manifest() {
        let objects = parse_manifest(MANIFEST).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind(), "ConfigMap");
        assert_eq!(objects[0].get(&["metadata", "customField"]).unwrap(), "kept");
        assert_eq!(objects[1].name(), "web");
        assert_eq!(objects[1].replicas(), Some(2));
    }

    #[test]
    fn test_parse_rejects_kindless_document() {
        assert!(parse_manifest("foo: bar\n").is_err());
    }

    #[test]
    fn test_label_and_annotation_helpers() {
        let mut object = K8sObject::new("v1", "ConfigMap", "demo");
        object.set_label("release", "r");
        object.set_annotation("NeedIsomateName", "True");
        assert_eq!(object.label("release"), Some("r"));
        assert!(object.has_flag_annotation("NeedIsomateName"));
        assert_eq!(object.remove_label("release"), Some(json!("r")));
        assert!(object.label("release").is_none());
    }

    #[test]
    fn test_containers_mut_and_ensure_array() {
        let mut objects = parse_manifest(MANIFEST).unwrap();
        let deploy = &mut objects[1];
        for container in deploy.containers_mut() {
            container.insert("imagePullPolicy".into(), json!("Always"));
        }
        deploy
            .ensure_array(&["spec", "template", "spec"], "tolerations")
            .push(json!({"key": "k"}));

        assert_eq!(
            deploy.get(&["spec", "template", "spec", "containers"]).unwrap()[0]["imagePullPolicy"],
            "Always"
        );
        assert_eq!(
            deploy
                .get(&["spec", "template", "spec", "tolerations"])
                .unwrap()
                .as_array()
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_for_each_kind_and_round_trip() {
        let mut objects = parse_manifest(MANIFEST).unwrap();
        for_each_kind(&mut objects, &[kinds::DEPLOYMENT], |o| {
            o.set_replicas(0);
            Ok(())
        })
        .unwrap();
        let reparsed = parse_manifest(&to_manifest(&objects).unwrap()).unwrap();
        assert_eq!(reparsed, objects);
        assert_eq!(reparsed[1].replicas(), Some(0));
    }
}
