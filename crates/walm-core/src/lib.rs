//! Walm Core - domain types for the release lifecycle controller
//!
//! This crate holds everything that needs no I/O:
//! - `Values`: the shared values tree with merge and reuse semantics
//! - `ReleaseRequest` / `ReleaseCache` / `ReleaseTask`: release state
//! - `ChartMetaInfo`: chart side-car and its parameter projections
//! - `ReleasePlugin`: plugin entries and merge rules
//! - `Statement` / `DependencyMeta`: cross-release dependency primitives
//! - `K8sObject`: generic manifest objects

pub mod chart;
pub mod dependency;
pub mod error;
pub mod metainfo;
pub mod object;
pub mod plugin;
pub mod project;
pub mod release;
pub mod release_config;
pub mod values;

pub use chart::{ChartDialect, ChartFile, ChartInfo, ChartMetadata, LoadedChart};
pub use dependency::{DependencyMeta, DependencyTarget, LegacyAppInfo, Statement};
pub use error::{CoreError, Result};
pub use metainfo::{ChartMetaInfo, MetaInfoParams};
pub use object::{K8sObject, kinds, parse_manifest, to_manifest};
pub use plugin::{ReleasePlugin, WALM_PLUGIN_KEY};
pub use project::{ProjectInfo, ProjectParams};
pub use release::{
    IsomateConfig, MsgCode, ProjectTask, ReleaseCache, ReleaseInfoV2, ReleaseRequest,
    ReleaseSpec, ReleaseTask, ResourceMeta, TaskSig,
};
pub use release_config::{ReleaseConfig, ReleaseConfigSpec};
pub use values::Values;
