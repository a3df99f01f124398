#![forbid(unsafe_code)]
//! prevega-exec: executors, dispatch, DAG scheduling and result merging.
//!
//! One request flows through `runtime::PreTransformRuntime`:
//! - the specification's data sources are extracted into a DAG,
//! - `scheduler` walks it parents-first, running independent sources
//!   concurrently on blocking tasks bounded by `max_parallel_tasks`,
//! - each source's plan goes through `dispatch` to an `Executor`,
//! - `merge` writes the computed tables (or vendor references) back.
//!
//! Executors are synchronous and may block; the runtime keeps them off the
//! async worker threads.

pub mod dispatch;
pub mod error;
pub mod executor;
pub mod merge;
pub mod metrics;
pub mod result;
pub mod runtime;
pub mod scheduler;

pub use error::ExecError;
pub use executor::{
    CallbackExecutor, Executor, ExecutorError, ExecutorOutput, LocalExecutor, PlanFormat,
    PlanRequest, RemoteExecutor, RemotePlan, ScanInput,
};
pub use result::{ExecutionResult, ResultMetadata};
pub use runtime::{PreTransformOutput, PreTransformRuntime};
