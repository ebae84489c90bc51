//! Walm chart sources
//!
//! - **HTTP repositories**: Helm-style repos serving `index.yaml`
//! - **OCI registries**: chart images pulled by reference
//! - **Inline files**: charts uploaded with the request
//!
//! [`ChartSource`] is what the release core depends on; [`RepoChartSource`]
//! is the production implementation and [`MemoryChartSource`] serves tests.

pub mod config;
pub mod error;
pub mod http;
pub mod index;
pub mod oci;
pub mod source;

pub use config::{Repository, RepositoryConfig, RepositoryType};
pub use error::{RepoError, Result};
pub use http::HttpRepository;
pub use index::{ChartEntry, RepositoryIndex};
pub use oci::{OciReference, OciRegistry};
pub use source::{ChartRequest, ChartSource, MemoryChartSource, RepoChartSource};
