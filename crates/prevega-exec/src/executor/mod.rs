//! The executor boundary.
//!
//! An executor receives one compiled plan per data source and returns the
//! table it evaluates to. How it gets there is its own business: the local
//! engine walks the plan in-process, a callback may hand SQL text to a
//! warehouse, a remote executor ships a JSON document over a channel.

mod callback;
mod local;
mod remote;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use prevega_core::config::SqlDialect;
use prevega_core::dag::LogicalPlan;
use prevega_core::registry::ExternalHandle;
use prevega_core::types::Table;
use prevega_planner::Capabilities;

pub use callback::CallbackExecutor;
pub use local::LocalExecutor;
pub use remote::{RemoteExecutor, RemoteReply};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor failed: {0}")]
    Failed(String),

    #[error("cannot resolve input: {0}")]
    Unresolvable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("executor panicked: {0}")]
    Panicked(String),

    #[error("invalid executor result: {0}")]
    InvalidResult(String),
}

/// How an executor wants the plan handed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFormat {
    /// The `LogicalPlan` value itself.
    Structured,
    /// A serialized `RemotePlan` document.
    Json,
    /// SQL text in the given dialect.
    Sql(SqlDialect),
}

/// Data behind one scan of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanInput {
    Inline(Table),
    External(ExternalHandle),
}

/// One dispatch: the plan for `dataset` plus the data its scans read.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub dataset: String,
    pub plan: LogicalPlan,
    pub format: PlanFormat,
    /// JSON or SQL text for the non-structured formats.
    pub rendered: Option<String>,
    /// Keyed by the scanned dataset name.
    pub inputs: HashMap<String, ScanInput>,
}

/// Wire form of a plan request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePlan {
    pub dataset: String,
    pub plan: LogicalPlan,
    pub inputs: BTreeMap<String, ScanInput>,
}

impl RemotePlan {
    pub fn from_request(request: &PlanRequest) -> Self {
        Self {
            dataset: request.dataset.clone(),
            plan: request.plan.clone(),
            inputs: request
                .inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, ExecutorError> {
        serde_json::to_string(self).map_err(|e| ExecutorError::Transport(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self, ExecutorError> {
        serde_json::from_str(s).map_err(|e| ExecutorError::Transport(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorOutput {
    pub table: Table,
    /// Signal values computed along the plan (extent, bin).
    pub signals: BTreeMap<String, Value>,
}

impl ExecutorOutput {
    pub fn table(table: Table) -> Self {
        Self {
            table,
            signals: BTreeMap::new(),
        }
    }
}

/// Evaluates compiled plans.
///
/// Implementations are called from blocking worker threads and may block.
/// They must return a table whose column set equals the plan's output
/// schema; the dispatcher checks this.
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Transform kinds this executor accepts; the plan builder stops folding
    /// at the first transform outside this set.
    fn capabilities(&self) -> Capabilities;

    fn plan_format(&self) -> PlanFormat {
        PlanFormat::Structured
    }

    fn execute(&self, request: &PlanRequest) -> Result<ExecutorOutput, ExecutorError>;
}
