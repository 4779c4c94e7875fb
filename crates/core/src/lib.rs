//! Core engine for the weft corpus-processing pipeline.
//!
//! The engine turns a declarative corpus description (source files, requested
//! annotations, export formats) plus a registry of processors into an
//! executed DAG of file-producing jobs:
//!
//! ```text
//! ConfigStore (corpus.yaml + parents + defaults)
//!       │
//! Registry (processor discovery & validation)
//!       │
//! Resolver (classes, config placeholders, wildcards)
//!       │
//! RuleCompiler (one rule per processor, conflict resolution)
//!       │
//! Scheduler (file-level DAG, worker pool, incremental keys)
//! ```
//!
//! Processor function bodies are external collaborators: the engine only
//! routes opaque annotation payloads between them via the work directory.

pub mod compile;
pub mod config;
pub mod dirs;
pub mod exec;
pub mod io;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod resolve;
pub mod schedule;

mod error;
pub use error::{Error, Result};

#[cfg(test)]
pub(crate) mod testutil;
