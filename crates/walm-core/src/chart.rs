//! In-memory charts
//!
//! A chart is loaded from a flat list of files (inline upload) or from a
//! gzipped tarball (repository download, OCI layer). Loading discovers the
//! chart's dialect from its side-car files.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use tar::{Archive, Builder, Header};

use crate::dependency::{LEGACY_APP_PATH, LegacyAppInfo};
use crate::error::{CoreError, Result};
use crate::metainfo::{ChartMetaInfo, METAINFO_PATH};
use crate::values::Values;

pub const CHART_YAML: &str = "Chart.yaml";
pub const VALUES_YAML: &str = "values.yaml";
pub const TEMPLATES_DIR: &str = "templates/";

/// Meta-info schema generation of a chart
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChartDialect {
    #[serde(rename = "v1")]
    V1,
    #[default]
    #[serde(rename = "v2")]
    V2,
}

impl fmt::Display for ChartDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChartDialect::V1 => write!(f, "v1"),
            ChartDialect::V2 => write!(f, "v2"),
        }
    }
}

/// One file of a chart; `data` travels base64-encoded in JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartFile {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl ChartFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// `Chart.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub app_version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub api_version: String,
}

/// What the dependency resolver needs to know about a chart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartInfo {
    #[serde(default)]
    pub dialect: ChartDialect,

    #[serde(default)]
    pub meta_info: Option<ChartMetaInfo>,

    #[serde(default)]
    pub app_info: Option<LegacyAppInfo>,
}

/// A chart held in memory for the duration of one render
#[derive(Debug, Clone)]
pub struct LoadedChart {
    pub metadata: ChartMetadata,

    /// Parsed `values.yaml`
    pub default_values: Values,

    /// Template sources keyed by path relative to the chart root
    pub templates: BTreeMap<String, String>,

    /// Every other file, keyed by path relative to the chart root
    pub files: BTreeMap<String, Vec<u8>>,

    pub info: ChartInfo,
}

impl LoadedChart {
    /// Load from a flat list of files, stripping a shared top-level directory
    pub fn from_files(files: Vec<ChartFile>) -> Result<Self> {
        let prefix = common_root(&files);
        let mut by_path: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for file in files {
            let path = file
                .name
                .trim_start_matches("./")
                .strip_prefix(prefix.as_str())
                .unwrap_or(&file.name)
                .to_string();
            if !path.is_empty() {
                by_path.insert(path, file.data);
            }
        }

        let chart_yaml = by_path.remove(CHART_YAML).ok_or_else(|| CoreError::InvalidChart {
            message: format!("{} is missing", CHART_YAML),
        })?;
        let metadata: ChartMetadata = serde_yaml::from_slice(&chart_yaml)?;
        if metadata.name.is_empty() {
            return Err(CoreError::MissingField {
                field: "Chart.yaml name".to_string(),
            });
        }

        let default_values = match by_path.remove(VALUES_YAML) {
            Some(content) => Values::from_yaml(&utf8(VALUES_YAML, content)?)?,
            None => Values::new(),
        };

        let meta_info = match by_path.get(METAINFO_PATH) {
            Some(content) => Some(ChartMetaInfo::from_yaml(&utf8(METAINFO_PATH, content.clone())?)?),
            None => None,
        };
        let app_info = match by_path.get(LEGACY_APP_PATH) {
            Some(content) => Some(LegacyAppInfo::from_yaml(&utf8(LEGACY_APP_PATH, content.clone())?)?),
            None => None,
        };
        // the newer dialect wins when both side-cars are present
        let dialect = if meta_info.is_none() && app_info.is_some() {
            ChartDialect::V1
        } else {
            ChartDialect::V2
        };

        let mut templates = BTreeMap::new();
        let mut others = BTreeMap::new();
        for (path, data) in by_path {
            if path.starts_with(TEMPLATES_DIR) {
                templates.insert(path.clone(), utf8(&path, data)?);
            } else {
                others.insert(path, data);
            }
        }

        Ok(Self {
            metadata,
            default_values,
            templates,
            files: others,
            info: ChartInfo {
                dialect,
                meta_info,
                app_info,
            },
        })
    }

    /// Load from a gzipped tarball
    pub fn from_archive(bytes: &[u8]) -> Result<Self> {
        Self::from_files(unpack_archive(bytes)?)
    }

    pub fn dialect(&self) -> ChartDialect {
        self.info.dialect
    }

    pub fn meta_info(&self) -> Option<&ChartMetaInfo> {
        self.info.meta_info.as_ref()
    }

    /// Append a template that is rendered with the chart's own templates
    pub fn add_template(&mut self, name: &str, content: String) {
        self.templates
            .insert(format!("{}{}", TEMPLATES_DIR, name), content);
    }
}

fn utf8(path: &str, data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|_| CoreError::InvalidChart {
        message: format!("{} is not valid UTF-8", path),
    })
}

/// `<dir>/` when every file lives under the same top-level directory and
/// `Chart.yaml` is not at the root
fn common_root(files: &[ChartFile]) -> String {
    let names: Vec<&str> = files
        .iter()
        .map(|f| f.name.trim_start_matches("./"))
        .collect();
    if names.contains(&CHART_YAML) {
        return String::new();
    }
    let first = match names.first().and_then(|n| n.split_once('/')) {
        Some((dir, _)) => dir,
        None => return String::new(),
    };
    let prefix = format!("{}/", first);
    if names.iter().all(|n| n.starts_with(&prefix)) {
        prefix
    } else {
        String::new()
    }
}

/// Extract the regular files of a `.tgz`
pub fn unpack_archive(bytes: &[u8]) -> Result<Vec<ChartFile>> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut files = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.push(ChartFile::new(path, data));
    }

    if files.is_empty() {
        return Err(CoreError::Archive {
            message: "archive contains no files".to_string(),
        });
    }
    Ok(files)
}

/// Build a `.tgz` from chart files, each stored under `<root>/`
pub fn pack_archive(root: &str, files: &[ChartFile]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    for file in files {
        let mut header = Header::new_gnu();
        header.set_size(file.data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, format!("{}/{}", root, file.name), file.data.as_slice())?;
    }

    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    Ok(encoder.finish()?)
}
