#![forbid(unsafe_code)]
//! prevega-planner: from a visualization specification to one
//! `LogicalPlan` per data source.
//!
//! Design:
//! - `spec`/`pipeline` walk the top-level `data` array into a `SourceGraph`
//!   (a DAG keyed by data source name).
//! - `transform` parses each transform into a closed `Transform` enum;
//!   anything unrecognized becomes `Transform::Unsupported`.
//! - `signals` freezes the signal values that are known before rendering.
//! - `builder` folds the longest supported prefix of a transform list onto
//!   the source's input plan, honoring the executor's `Capabilities`.
//! - `sql` renders plans for executors that consume SQL text.
//!
//! Nothing here evaluates data.

pub mod builder;
pub mod capabilities;
pub mod pipeline;
pub mod signals;
pub mod spec;
pub mod sql;
pub mod transform;

pub use builder::{BuiltPlan, PlanBuilder, StopReason};
pub use capabilities::Capabilities;
pub use pipeline::{DataSource, SourceGraph, Upstream};
pub use signals::{SignalScope, SignalValue};
pub use spec::Specification;
pub use sql::{can_render, can_render_plan, ScanSource, SqlRenderer};
pub use transform::{Transform, TransformKind, TransformSpec};
