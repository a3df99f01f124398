#![forbid(unsafe_code)]
//! prevega-operators: the embedded engine behind `LocalExecutor`.
//!
//! Design intent:
//! - Pure and synchronous; the exec crate moves calls onto blocking threads.
//! - One operator per `LogicalPlan` node kind. Each exposes `plan` (output
//!   schema from input schema) and `eval` (whole-table evaluation).
//! - Semantics follow the Vega dataflow transforms, not SQL, wherever the two
//!   disagree (null handling, default names, peer frames).
//! - Operators that publish signals (`extent`, `bin`) write them into the
//!   `EvalContext` shared along one plan chain.

pub mod traits;

pub mod aggregate;
pub mod bin;
pub mod filter;
pub mod fold;
pub mod formula;
pub mod project;
pub mod sort;
pub mod stack;
pub mod timeunit;
pub mod window;

pub mod engine;

pub use engine::{execute, operator_for};
pub use traits::{EvalContext, OpError, Operator};
