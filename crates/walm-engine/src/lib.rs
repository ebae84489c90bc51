//! Walm Engine - chart templating for Kubernetes releases
//!
//! This crate provides a MiniJinja-based template engine with:
//! - Kubernetes-specific filters (toyaml, b64encode, nindent, ...)
//! - A single `render_chart` entry point that hides the chart dialect
//! - Template errors carrying source spans for diagnostics

pub mod engine;
pub mod error;
pub mod filters;
pub mod functions;

pub use engine::{Engine, EngineBuilder, ReleaseContext, RenderContext, RenderedChart};
pub use error::{EngineError, Result, TemplateError, TemplateErrorKind};
