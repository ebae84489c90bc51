//! Walm Kube - release lifecycle controller core
//!
//! This crate provides:
//! - **Release Store**: task pointers, render caches, backups and project tasks over a KV backend
//! - **Plugin Pipeline**: named manifest transformations run on every apply
//! - **Dependency Resolver**: upstream ReleaseConfig outputs for both chart dialects
//! - **Chart Processor**: load, merge values, render, apply and cache a release
//! - **Release Engine**: task-per-release lifecycle with in-flight guarding and retries
//! - **Project Orchestrator**: dependency-ordered batches and sibling re-submits
//! - **Collaborators**: task runner, cluster client and apply layer behind traits

pub mod apply;
pub mod cluster;
pub mod config;
pub mod error;
pub mod planning;
pub mod plugins;
pub mod processor;
pub mod project;
pub mod release;
pub mod resolver;
pub mod status;
pub mod store;
pub mod task;

pub use apply::{AppliedRelease, ApplyRequest, ManifestApplier, ReleaseApplier, RenderedVariant};
pub use cluster::{ClusterClient, KubeCluster, LabelSelector, MockCluster};
pub use config::{StoreBackend, WalmConfig};
pub use error::{Result, WalmError};
pub use planning::{ReleaseResources, WorkloadResources, compute_resources};
pub use plugins::{ManifestPlugin, PluginContext, PluginRegistry};
pub use processor::{ChartProcessor, ProcessOptions};
pub use project::ProjectManager;
pub use release::{ReleaseManager, SubmitMode};
pub use resolver::{DEFAULT_STRICT, DependencyResolver};
pub use status::{ReleaseStatus, ResourceHealth};
pub use store::{KvBackend, MemoryBackend, ReleaseStore, SecretsBackend};
pub use task::{LocalTaskRunner, TaskHandler, TaskRunner, TaskState};
