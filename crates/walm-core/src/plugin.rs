//! Release plugin entries and the rules for merging them
//!
//! A release carries an ordered list of plugin entries. The chart's meta-info
//! may declare defaults; the caller's list wins on name conflicts. Two
//! entries are managed by the system and appended last: `PauseRelease`
//! (when a pause state is requested) and `ValidateReleaseConfig` (always).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;

use crate::error::{CoreError, Result};
use crate::values::Values;

/// Reserved values key under which the final plugin list is embedded
pub const WALM_PLUGIN_KEY: &str = "Walm-Plugin-Key";

/// Well-known plugin names
pub mod names {
    pub const CUSTOM_CONFIGMAP: &str = "CustomConfigmap";
    pub const CUSTOM_INGRESS: &str = "CustomIngress";
    pub const CUSTOM_HEALTH_PROBE: &str = "CustomHealthProbe";
    pub const LABEL_POD: &str = "LabelPod";
    pub const NODE_SELECTOR: &str = "NodeSelector";
    pub const ISOMATE_NAME: &str = "IsomateName";
    pub const ISOMATE_SET_CONVERTER: &str = "IsomateSetConverter";
    pub const PAUSE_RELEASE: &str = "PauseRelease";
    pub const VALIDATE_RELEASE_CONFIG: &str = "ValidateReleaseConfig";
    pub const BUILT_IN_SELECTOR: &str = "BuiltInSelector";
}

/// One plugin entry on a release
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleasePlugin {
    pub name: String,

    /// Opaque JSON arguments understood by the plugin
    #[serde(default)]
    pub args: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub disable: bool,
}

impl ReleasePlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disable = true;
        self
    }

    fn is_system_managed(&self) -> bool {
        self.name == names::VALIDATE_RELEASE_CONFIG || self.name == names::PAUSE_RELEASE
    }
}

fn ensure_unique(plugins: &[ReleasePlugin], source_list: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for plugin in plugins {
        if !seen.insert(plugin.name.as_str()) {
            return Err(CoreError::DuplicatePlugin {
                name: plugin.name.clone(),
                source_list: source_list.to_string(),
            });
        }
    }
    Ok(())
}

/// Name-union of two plugin lists where entries of `overlay` win
///
/// Order: base entries first (replaced in place when overridden), then the
/// overlay entries that were not in the base. Duplicate names inside either
/// list are rejected.
pub fn merge_plugins(
    base: &[ReleasePlugin],
    overlay: &[ReleasePlugin],
) -> Result<Vec<ReleasePlugin>> {
    ensure_unique(base, "chart")?;
    ensure_unique(overlay, "release")?;

    let mut merged: Vec<ReleasePlugin> = base
        .iter()
        .map(|b| {
            overlay
                .iter()
                .find(|o| o.name == b.name)
                .cloned()
                .unwrap_or_else(|| b.clone())
        })
        .collect();

    for plugin in overlay {
        if !base.iter().any(|b| b.name == plugin.name) {
            merged.push(plugin.clone());
        }
    }

    Ok(merged)
}

/// Build the final plugin list handed to the pipeline
///
/// `paused`: `Some(true)` appends an enabled `PauseRelease`, `Some(false)` a
/// disabled one, `None` keeps whatever pause entry `merged` already carries.
/// `ValidateReleaseConfig` is always forced on and placed last.
pub fn finalize_plugins(merged: Vec<ReleasePlugin>, paused: Option<bool>) -> Vec<ReleasePlugin> {
    let existing_pause = merged
        .iter()
        .find(|p| p.name == names::PAUSE_RELEASE)
        .cloned();

    let mut plugins: Vec<ReleasePlugin> = merged
        .into_iter()
        .filter(|p| !p.is_system_managed())
        .collect();

    let pause = match paused {
        Some(true) => Some(ReleasePlugin::new(names::PAUSE_RELEASE)),
        Some(false) => Some(ReleasePlugin::new(names::PAUSE_RELEASE).disabled()),
        None => existing_pause,
    };
    plugins.extend(pause);
    plugins.push(ReleasePlugin::new(names::VALIDATE_RELEASE_CONFIG));
    plugins
}

/// True iff an enabled `PauseRelease` entry is present
pub fn is_paused(plugins: &[ReleasePlugin]) -> bool {
    plugins
        .iter()
        .any(|p| p.name == names::PAUSE_RELEASE && !p.disable)
}

/// Write the plugin list under [`WALM_PLUGIN_KEY`]
pub fn embed_plugins(values: &mut Values, plugins: &[ReleasePlugin]) -> Result<()> {
    let list = serde_json::to_value(plugins)?;
    values.insert(WALM_PLUGIN_KEY, list);
    Ok(())
}

/// Read the plugin list back from [`WALM_PLUGIN_KEY`]
pub fn extract_plugins(values: &Values) -> Result<Vec<ReleasePlugin>> {
    match values.as_map().and_then(|m| m.get(WALM_PLUGIN_KEY)) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(list) => Ok(serde_json::from_value(list.clone())?),
    }
}
