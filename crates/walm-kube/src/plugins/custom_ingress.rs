use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use walm_core::plugin::names;
use walm_core::{K8sObject, kinds};

use super::annotations::{
    CUSTOM_INGRESS, INGRESS_CLASS, PLUGIN_HERITAGE, UPGRADE_POLICY, UPGRADE_POLICY_UPGRADE,
};
use super::{ManifestPlugin, PluginContext, parse_args};
use crate::error::{Result, WalmError};

static INGRESS_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9_.]*[a-z0-9])?$").expect("valid regex"));

const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngressToAdd {
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    service_name: String,
    #[serde(default)]
    service_port: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomIngressArgs {
    #[serde(default)]
    ingress_to_add: BTreeMap<String, IngressToAdd>,
    #[serde(default)]
    ingress_to_skip_names: Vec<String>,
    #[serde(default)]
    ingress_skip_all: bool,
}

/// Adds user Ingresses and pins existing ones on upgrade
#[derive(Debug, Default, Clone, Copy)]
pub struct CustomIngress;

fn ingress_name(key: &str, release: &str) -> String {
    format!("walmplugin-{}-{}-ingress", key, release)
}

fn validate(key: &str, ingress: &IngressToAdd) -> Result<()> {
    if key.len() > MAX_NAME_LEN || !INGRESS_NAME.is_match(key) {
        return Err(WalmError::InvalidArgument(format!(
            "ingress name '{}' must be at most {} characters of [a-z0-9-_.], starting and ending alphanumeric",
            key, MAX_NAME_LEN
        )));
    }
    if !ingress.path.starts_with('/') {
        return Err(WalmError::InvalidArgument(format!(
            "ingress '{}' path '{}' must start with '/'",
            key, ingress.path
        )));
    }
    if ingress.service_name.is_empty() || ingress.service_port.is_empty() {
        return Err(WalmError::InvalidArgument(format!(
            "ingress '{}' needs a serviceName and servicePort",
            key
        )));
    }
    Ok(())
}

/// Numeric ports become `number`, anything else a named port
fn backend_port(port: &str) -> serde_json::Value {
    match port.parse::<u16>() {
        Ok(number) => json!({ "number": number }),
        Err(_) => json!({ "name": port }),
    }
}

fn build_ingress(ctx: &PluginContext, key: &str, spec: &IngressToAdd) -> K8sObject {
    let mut ingress = K8sObject::new(
        "networking.k8s.io/v1",
        kinds::INGRESS,
        &ingress_name(key, &ctx.release_name),
    );
    ingress.set_namespace(&ctx.namespace);
    ingress.set_label("release", &ctx.release_name);
    ingress.set_label("heritage", PLUGIN_HERITAGE);
    for (k, v) in &spec.annotations {
        ingress.set_annotation(k, v);
    }
    ingress.set_annotation(INGRESS_CLASS, "nginx");
    ingress.set_annotation(CUSTOM_INGRESS, "true");

    let mut rule = json!({
        "http": {
            "paths": [{
                "path": spec.path,
                "pathType": "Prefix",
                "backend": {
                    "service": {
                        "name": spec.service_name,
                        "port": backend_port(&spec.service_port),
                    }
                }
            }]
        }
    });
    if !spec.host.is_empty() {
        rule["host"] = json!(spec.host);
    }
    ingress.set(&["spec", "rules"], json!([rule]));
    ingress
}

#[async_trait]
impl ManifestPlugin for CustomIngress {
    fn name(&self) -> &'static str {
        names::CUSTOM_INGRESS
    }

    async fn transform(
        &self,
        ctx: &PluginContext,
        args: &str,
        mut objects: Vec<K8sObject>,
    ) -> Result<Vec<K8sObject>> {
        let args: CustomIngressArgs = parse_args(args)?;
        for (key, spec) in &args.ingress_to_add {
            validate(key, spec)?;
        }

        for object in objects.iter_mut().filter(|o| o.is_kind(kinds::INGRESS)) {
            if object.has_flag_annotation(CUSTOM_INGRESS) {
                continue;
            }
            if args.ingress_skip_all || args.ingress_to_skip_names.iter().any(|n| n == object.name()) {
                object.set_annotation(UPGRADE_POLICY, UPGRADE_POLICY_UPGRADE);
            }
        }

        objects.extend(
            args.ingress_to_add
                .iter()
                .map(|(key, spec)| build_ingress(ctx, key, spec)),
        );
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_adds_ingress() {
        let args = r#"{
            "ingressToAdd": {
                "ui": {"host": "ui.example.com", "path": "/", "serviceName": "web", "servicePort": "8080",
                       "annotations": {"nginx.ingress.kubernetes.io/rewrite-target": "/"}}
            },
            "ingressToSkipNames": ["web"]
        }"#;
        let existing = K8sObject::new("networking.k8s.io/v1", kinds::INGRESS, "web");

        let out = CustomIngress
            .transform(&context("r"), args, vec![existing])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].annotation(UPGRADE_POLICY), Some("Upgrade"));

        let ingress = &out[1];
        assert_eq!(ingress.name(), "walmplugin-ui-r-ingress");
        assert_eq!(ingress.annotation(INGRESS_CLASS), Some("nginx"));
        assert!(ingress.has_flag_annotation(CUSTOM_INGRESS));
        let rule = &ingress.get(&["spec", "rules"]).unwrap()[0];
        assert_eq!(rule["host"], "ui.example.com");
        assert_eq!(rule["http"]["paths"][0]["backend"]["service"]["port"]["number"], 8080);
    }

    #[tokio::test]
    async fn test_validation() {
        let cases = [
            r#"{"ingressToAdd":{"Bad":{"path":"/","serviceName":"s","servicePort":"80"}}}"#,
            r#"{"ingressToAdd":{"ok":{"path":"nope","serviceName":"s","servicePort":"80"}}}"#,
            r#"{"ingressToAdd":{"ok":{"path":"/","serviceName":"","servicePort":"80"}}}"#,
        ];
        for args in cases {
            let err = CustomIngress
                .transform(&context("r"), args, Vec::new())
                .await
                .unwrap_err();
            assert!(err.is_invalid_argument(), "{args}: {err}");
        }

        let long = "a".repeat(64);
        let args = format!(
            r#"{{"ingressToAdd":{{"{}":{{"path":"/","serviceName":"s","servicePort":"http"}}}}}}"#,
            long
        );
        assert!(CustomIngress.transform(&context("r"), &args, Vec::new()).await.is_err());
    }

    #[test]
    fn test_backend_port() {
        assert_eq!(backend_port("80"), json!({"number": 80}));
        assert_eq!(backend_port("http"), json!({"name": "http"}));
    }
}
