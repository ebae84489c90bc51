//! Project-level request and view types

use serde::{Deserialize, Serialize};

use crate::release::{ReleaseInfoV2, ReleaseRequest};
use crate::values::Values;

/// A batch of releases installed or updated together
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectParams {
    /// Merged under every member's own config values
    #[serde(default)]
    pub common_values: Values,

    #[serde(default)]
    pub releases: Vec<ReleaseRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub releases: Vec<ReleaseInfoV2>,
    /// True iff every member release is ready
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub message: String,
}

impl ProjectInfo {
    pub fn from_releases(namespace: &str, name: &str, releases: Vec<ReleaseInfoV2>) -> Self {
        let ready = !releases.is_empty() && releases.iter().all(|r| r.ready);
        let message = releases
            .iter()
            .filter(|r| !r.ready)
            .map(|r| {
                if r.message.is_empty() {
                    format!("release {} is not ready", r.spec.name)
                } else {
                    format!("release {}: {}", r.spec.name, r.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            releases,
            ready,
            message,
        }
    }
}
