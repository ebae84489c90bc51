//! Kubernetes Secrets backend
//!
//! Each record lives in its own Secret inside one configured namespace:
//! - payload is zstd compressed then base64 encoded under `data.record`
//! - the record key is spread over labels so listings are label-selected

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use std::collections::BTreeMap;

use super::{KvBackend, split_key};
use crate::error::{Result, WalmError};

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "walm";
const KIND_LABEL: &str = "walm.transwarp.io/record-kind";
const NAMESPACE_LABEL: &str = "walm.transwarp.io/record-namespace";
const NAME_LABEL: &str = "walm.transwarp.io/record-name";
const DATA_KEY: &str = "record";
const SECRET_TYPE: &str = "walm.transwarp.io/record.v1";
const ZSTD_LEVEL: i32 = 3;

pub struct SecretsBackend {
    client: Client,
    namespace: String,
}

impl SecretsBackend {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Secret name of a record key
fn secret_name(key: &str) -> Result<String> {
    let (kind, namespace, name) = split_key(key)
        .ok_or_else(|| WalmError::Store(format!("malformed record key '{}'", key)))?;
    Ok(format!("walm.{}.{}.{}", kind, namespace, name))
}

/// Label selector of a listing prefix (`kind:` or `kind:namespace:`)
fn prefix_selector(prefix: &str) -> String {
    let mut selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY);
    let mut parts = prefix.split(':').filter(|p| !p.is_empty());
    if let Some(kind) = parts.next() {
        selector.push_str(&format!(",{}={}", KIND_LABEL, kind));
    }
    if let Some(namespace) = parts.next() {
        selector.push_str(&format!(",{}={}", NAMESPACE_LABEL, namespace));
    }
    selector
}

fn encode(value: &[u8]) -> Result<Vec<u8>> {
    let compressed = zstd::encode_all(value, ZSTD_LEVEL)
        .map_err(|e| WalmError::Store(format!("compression error: {}", e)))?;
    Ok(STANDARD.encode(compressed).into_bytes())
}

fn decode(data: &[u8]) -> Result<Vec<u8>> {
    let compressed = STANDARD
        .decode(data)
        .map_err(|e| WalmError::Store(format!("base64 decode error: {}", e)))?;
    zstd::decode_all(compressed.as_slice())
        .map_err(|e| WalmError::Store(format!("decompression error: {}", e)))
}

fn build_secret(namespace: &str, key: &str, value: &[u8]) -> Result<Secret> {
    let (kind, record_namespace, name) = split_key(key)
        .ok_or_else(|| WalmError::Store(format!("malformed record key '{}'", key)))?;

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels.insert(KIND_LABEL.to_string(), kind.to_string());
    labels.insert(NAMESPACE_LABEL.to_string(), record_namespace.to_string());
    labels.insert(NAME_LABEL.to_string(), name.to_string());

    let mut data = BTreeMap::new();
    data.insert(DATA_KEY.to_string(), ByteString(encode(value)?));

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(key)?),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some(SECRET_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    })
}

/// Record key and payload of a Secret
fn parse_secret(secret: &Secret) -> Result<(String, Vec<u8>)> {
    let label = |key: &str| {
        secret
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .cloned()
            .ok_or_else(|| WalmError::Store(format!("secret is missing label {}", key)))
    };
    let key = format!(
        "{}:{}:{}",
        label(KIND_LABEL)?,
        label(NAMESPACE_LABEL)?,
        label(NAME_LABEL)?
    );

    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(DATA_KEY))
        .ok_or_else(|| WalmError::Store(format!("secret of {} has no '{}' data", key, DATA_KEY)))?;
    Ok((key, decode(&data.0)?))
}

#[async_trait]
impl KvBackend for SecretsBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.api().get_opt(&secret_name(key)?).await? {
            Some(secret) => Ok(Some(parse_secret(&secret)?.1)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let api = self.api();
        let name = secret_name(key)?;
        let secret = build_secret(&self.namespace, key, &value)?;

        match api.get_opt(&name).await? {
            Some(_) => {
                api.replace(&name, &PostParams::default(), &secret).await?;
            }
            None => {
                api.create(&PostParams::default(), &secret).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self
            .api()
            .delete(&secret_name(key)?, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let lp = ListParams::default().labels(&prefix_selector(prefix));
        let secrets = self.api().list(&lp).await?;

        let mut entries = Vec::new();
        for secret in &secrets.items {
            let (key, value) = parse_secret(secret)?;
            if key.starts_with(prefix) {
                entries.push((key, value));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
