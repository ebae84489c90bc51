//! Cross-release dependency primitives
//!
//! - [`DependencyTarget`]: the `[<namespace>/]<name>` reference stored as a
//!   dependency value
//! - [`Statement`]: the legacy `$(VAR).a.b` expression evaluated against an
//!   upstream's [`DependencyMeta`]
//! - [`LegacyAppInfo`]: the v1 chart side-car declaring dependency charts

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, Result};
use crate::release::validate_dns_label;

/// Path of the legacy (v1) application side-car inside a chart
pub const LEGACY_APP_PATH: &str = "transwarp-app.yaml";

/// Reserved `Provides` key wrapping a whole output config across dialects
pub const COMPATIBLE_PROVIDE_KEY: &str = "Walm-Compatible-Output-Config";

/// A dependency value: `[<namespace>/]<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyTarget {
    pub namespace: String,
    pub name: String,
}

impl DependencyTarget {
    /// Parse a dependency value, inheriting `default_namespace` when omitted
    pub fn parse(value: &str, default_namespace: &str) -> Result<Self> {
        let (namespace, name) = match value.split_once('/') {
            Some((ns, name)) if !ns.is_empty() => (ns, name),
            Some((_, name)) => (default_namespace, name),
            None => (default_namespace, value),
        };
        validate_dns_label(name).map_err(|e| {
            CoreError::invalid(format!("invalid dependency '{}': {}", value, e))
        })?;
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for DependencyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ========== Statements ==========

/// Parsed `$(VAR).a.b.c`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub variable: String,
    pub path: Vec<String>,
}

impl Statement {
    /// Parse `statement := "$(" IDENT ")" ("." IDENT)*` where IDENT is
    /// one or more of `[A-Za-z0-9_]`
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = StatementParser { input, pos: 0 };
        parser.expect("$(")?;
        let variable = parser.ident()?;
        parser.expect(")")?;
        let mut path = Vec::new();
        while !parser.at_end() {
            parser.expect(".")?;
            path.push(parser.ident()?);
        }
        Ok(Self { variable, path })
    }
}

struct StatementParser<'a> {
    input: &'a str,
    pos: usize,
}

impl StatementParser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn fail(&self, reason: impl Into<String>) -> CoreError {
        CoreError::InvalidStatement {
            statement: self.input.to_string(),
            position: self.pos,
            reason: reason.into(),
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        if self.input[self.pos..].starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(self.fail(format!("expected '{}'", token)))
        }
    }

    fn ident(&mut self) -> Result<String> {
        let rest = &self.input[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.fail("expected identifier"));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }
}

// ========== DependencyMeta ==========

/// One produced value of a legacy release
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyProvide {
    #[serde(default)]
    pub resource_type: String,

    #[serde(default)]
    pub immediate_value: JsonValue,
}

/// Legacy (v1) description of what a release provides to its dependents
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyMeta {
    #[serde(default)]
    pub provides: BTreeMap<String, DependencyProvide>,
}

impl DependencyMeta {
    /// Wrap a whole output config under [`COMPATIBLE_PROVIDE_KEY`]
    pub fn bridge(output_config: &JsonValue) -> Self {
        let mut provides = BTreeMap::new();
        provides.insert(
            COMPATIBLE_PROVIDE_KEY.to_string(),
            DependencyProvide {
                resource_type: String::new(),
                immediate_value: output_config.clone(),
            },
        );
        Self { provides }
    }

    /// Rebuild provides from a same-dialect output config, one entry per key
    pub fn from_output_config(output_config: &JsonValue) -> Self {
        let provides = output_config
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            DependencyProvide {
                                resource_type: String::new(),
                                immediate_value: v.clone(),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { provides }
    }

    /// Flat `{name: immediateValue}` view
    pub fn flatten(&self) -> Map<String, JsonValue> {
        self.provides
            .iter()
            .map(|(k, v)| (k.clone(), v.immediate_value.clone()))
            .collect()
    }

    /// Evaluate a statement: look up the variable, then walk the path
    ///
    /// An unknown variable falls back to the cross-dialect bridge entry when
    /// one is present.
    pub fn evaluate(&self, statement: &Statement) -> Result<JsonValue> {
        let root = self
            .provides
            .get(&statement.variable)
            .or_else(|| self.provides.get(COMPATIBLE_PROVIDE_KEY))
            .ok_or_else(|| {
                CoreError::invalid(format!(
                    "provide '{}' does not exist",
                    statement.variable
                ))
            })?;

        let mut current = &root.immediate_value;
        for segment in &statement.path {
            current = current.get(segment).ok_or_else(|| {
                CoreError::invalid(format!(
                    "path '{}' does not exist under provide '{}'",
                    statement.path.join("."),
                    statement.variable
                ))
            })?;
        }
        Ok(current.clone())
    }
}

// ========== Legacy application side-car ==========

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAppInfo {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub dependencies: Vec<LegacyDependencyChart>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyDependencyChart {
    /// Dependency alias
    pub name: String,

    #[serde(default)]
    pub chart_name: String,

    #[serde(default)]
    pub min_version: String,

    #[serde(default)]
    pub max_version: String,

    /// Values key to statement
    #[serde(default)]
    pub requires: BTreeMap<String, String>,
}

impl LegacyAppInfo {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn dependency(&self, alias: &str) -> Option<&LegacyDependencyChart> {
        self.dependencies
            .iter()
            .find(|d| d.name == alias || (d.name.is_empty() && d.chart_name == alias))
    }
}

impl LegacyDependencyChart {
    /// Key the resolved requires are merged under
    pub fn result_key(&self) -> &str {
        if self.chart_name.is_empty() {
            &self.name
        } else {
            &self.chart_name
        }
    }
}
