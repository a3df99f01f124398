use std::fmt;
use std::sync::Arc;

use prevega_core::config::SqlDialect;
use prevega_core::types::Table;
use prevega_planner::Capabilities;

use super::{Executor, ExecutorError, ExecutorOutput, PlanFormat, PlanRequest};

type Callback = dyn Fn(&PlanRequest) -> Result<Table, String> + Send + Sync;

/// Wraps a caller-supplied closure.
///
/// The closure sees the plan in the format it asked for: the structured
/// request, the JSON `RemotePlan` document, or SQL text. Its error string is
/// surfaced as `ExecutorError::Failed`.
#[derive(Clone)]
pub struct CallbackExecutor {
    name: String,
    format: PlanFormat,
    capabilities: Capabilities,
    callback: Arc<Callback>,
}

impl CallbackExecutor {
    /// Receives the whole `PlanRequest`.
    pub fn structured<F>(f: F) -> Self
    where
        F: Fn(&PlanRequest) -> Result<Table, String> + Send + Sync + 'static,
    {
        Self {
            name: "callback".into(),
            format: PlanFormat::Structured,
            capabilities: Capabilities::all().with_signals(false),
            callback: Arc::new(f),
        }
    }

    /// Receives the serialized `RemotePlan`.
    pub fn json<F>(f: F) -> Self
    where
        F: Fn(&str) -> Result<Table, String> + Send + Sync + 'static,
    {
        Self {
            name: "callback-json".into(),
            format: PlanFormat::Json,
            capabilities: Capabilities::all().with_signals(false),
            callback: Arc::new(move |req: &PlanRequest| {
                let doc = req
                    .rendered
                    .as_deref()
                    .ok_or_else(|| "plan was not rendered as JSON".to_string())?;
                f(doc)
            }),
        }
    }

    /// Receives SQL text; only SQL-renderable transforms are folded.
    pub fn sql<F>(dialect: SqlDialect, f: F) -> Self
    where
        F: Fn(&str) -> Result<Table, String> + Send + Sync + 'static,
    {
        Self {
            name: "callback-sql".into(),
            format: PlanFormat::Sql(dialect),
            capabilities: Capabilities::sql(dialect),
            callback: Arc::new(move |req: &PlanRequest| {
                let sql = req
                    .rendered
                    .as_deref()
                    .ok_or_else(|| "plan was not rendered as SQL".to_string())?;
                f(sql)
            }),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Narrow (or widen) what the builder may fold for this callback.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl fmt::Debug for CallbackExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackExecutor")
            .field("name", &self.name)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl Executor for CallbackExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn plan_format(&self) -> PlanFormat {
        self.format
    }

    fn execute(&self, request: &PlanRequest) -> Result<ExecutorOutput, ExecutorError> {
        (self.callback)(request)
            .map(ExecutorOutput::table)
            .map_err(ExecutorError::Failed)
    }
}
