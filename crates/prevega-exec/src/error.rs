use thiserror::Error;

use crate::executor::ExecutorError;

/// Request-level failures. Everything else is downgraded to a warning.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Spec(#[from] prevega_core::error::Error),

    #[error("executor failed on dataset '{dataset}': {source}")]
    ExecutorFailure {
        dataset: String,
        #[source]
        source: ExecutorError,
    },

    #[error("scheduler: {0}")]
    Scheduler(String),
}
