//! Operator trait + common interfaces.
//!
//! The local engine builds one operator per plan node, asks it for its output
//! schema, then hands it the input table. Evaluation is whole-table: the
//! datasets a visualization pre-aggregates are small enough that streaming
//! would only add bookkeeping.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use prevega_core::prelude::Schema;
use prevega_core::types::Table;

#[derive(Debug, Error)]
pub enum OpError {
    #[error("planning error: {0}")]
    Plan(String),

    #[error("execution error: {0}")]
    Exec(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error(transparent)]
    Core(#[from] prevega_core::error::Error),
}

/// State shared by the operators of one plan chain.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    signals: BTreeMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, name: impl Into<String>, value: Value) {
        self.signals.insert(name.into(), value);
    }

    pub fn signal(&self, name: &str) -> Option<&Value> {
        self.signals.get(name)
    }

    pub fn into_signals(self) -> BTreeMap<String, Value> {
        self.signals
    }
}

/// Trait that all operators must implement.
///
/// Invariants:
/// - `eval` must be deterministic given the same input and context.
/// - The table returned by `eval` has exactly the columns of `plan`'s schema,
///   in that order.
pub trait Operator: Send + Sync {
    /// Human-readable operator name (stable).
    fn name(&self) -> &'static str;

    /// Output schema for the given input schema.
    fn plan(&self, input: &Schema) -> Result<Schema, OpError>;

    /// Evaluate over the whole input table.
    fn eval(&self, input: Table, ctx: &mut EvalContext) -> Result<Table, OpError>;
}
