//! Non-fatal diagnostics collected during one request.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// A transform could not be pre-evaluated; it stays client-side.
    UnsupportedTransform,
    /// A dataset was unbound, or a result did not match the plan schema.
    SchemaMismatch,
    /// A dataset was left unevaluated because something upstream was.
    PartialEvaluation,
    /// An executor failed and the request continued (`skip_dataset`).
    ExecutorFailure,
    /// A result was truncated to the configured row limit.
    RowLimitExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub dataset_name: String,
    pub message: String,
}

impl Warning {
    pub fn new(
        kind: WarningKind,
        dataset_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            dataset_name: dataset_name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} [{}]: {}",
            self.kind, self.dataset_name, self.message
        )
    }
}

/// Append-only warning sink shared by the branches of one request.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Mutex<Vec<Warning>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, warning: Warning) {
        match self.warnings.lock() {
            Ok(mut guard) => guard.push(warning),
            Err(poisoned) => poisoned.into_inner().push(warning),
        }
    }

    pub fn len(&self) -> usize {
        match self.warnings.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take all recorded warnings, in recording order.
    pub fn drain(&self) -> Vec<Warning> {
        match self.warnings.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}
