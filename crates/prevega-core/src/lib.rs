#![forbid(unsafe_code)]
//! prevega-core: shared data model for the pre-transform pipeline.
//!
//! Everything here is pure data plus small synchronous helpers:
//! - `schema`/`types`: column schemas and the columnar `Table`
//! - `expr`: the expression subset used by `filter`/`formula` and signal parameters
//! - `dag`: the relational `LogicalPlan` each data source compiles to
//! - `registry`: per-request dataset bindings
//! - `warning`: per-request diagnostics
//!
//! No async, no I/O. Planning lives in `prevega-planner`, evaluation in
//! `prevega-operators`, dispatch in `prevega-exec`.

pub mod config;
pub mod dag;
pub mod error;
pub mod expr;
pub mod hash;
pub mod prelude;
pub mod registry;
pub mod schema;
pub mod types;
pub mod warning;

#[cfg(feature = "arrow")]
pub mod arrow;

/// Crate version, stamped into vendor references.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
