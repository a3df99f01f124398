//! Hand a compiled plan to an executor and check what comes back.
//!
//! The dispatcher renders the plan in the executor's preferred format, turns
//! panics into errors, and enforces the output contract: the returned column
//! set must equal the plan's output schema. Columns are then reordered to
//! the schema's order. Nothing is retried.

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use tracing::debug;

use prevega_core::dag::LogicalPlan;
use prevega_core::schema::Schema;
use prevega_planner::SqlRenderer;

use crate::executor::{
    Executor, ExecutorError, ExecutorOutput, PlanFormat, PlanRequest, RemotePlan, ScanInput,
};

#[derive(Debug)]
pub enum DispatchError {
    Executor(ExecutorError),
    /// The executor answered, but with the wrong columns.
    SchemaMismatch(String),
}

impl From<ExecutorError> for DispatchError {
    fn from(e: ExecutorError) -> Self {
        DispatchError::Executor(e)
    }
}

/// Render `plan` as SQL, binding each scan to its input.
pub fn render_sql(
    dialect: prevega_core::config::SqlDialect,
    plan: &LogicalPlan,
    inputs: &HashMap<String, ScanInput>,
) -> Result<String, ExecutorError> {
    let mut renderer = SqlRenderer::new(dialect);
    for (dataset, input) in inputs {
        renderer = match input {
            ScanInput::Inline(table) => renderer.with_inline(dataset.clone(), table),
            ScanInput::External(handle) => renderer.with_table(dataset.clone(), &handle.table),
        };
    }
    renderer
        .render(plan)
        .map_err(|e| ExecutorError::Failed(format!("SQL rendering: {}", e)))
}

/// Build the request `executor` expects.
pub fn prepare(
    executor: &dyn Executor,
    dataset: &str,
    plan: LogicalPlan,
    inputs: HashMap<String, ScanInput>,
) -> Result<PlanRequest, ExecutorError> {
    let format = executor.plan_format();
    let mut request = PlanRequest {
        dataset: dataset.to_string(),
        plan,
        format,
        rendered: None,
        inputs,
    };
    request.rendered = match format {
        PlanFormat::Structured => None,
        PlanFormat::Json => Some(RemotePlan::from_request(&request).to_json()?),
        PlanFormat::Sql(dialect) => Some(render_sql(dialect, &request.plan, &request.inputs)?),
    };
    Ok(request)
}

/// Run `request` on `executor` and enforce the output contract.
pub fn dispatch(
    executor: &dyn Executor,
    request: &PlanRequest,
    expected: &Schema,
) -> Result<ExecutorOutput, DispatchError> {
    let started = Instant::now();
    let mut output = catch_unwind(AssertUnwindSafe(|| executor.execute(request)))
        .map_err(|payload| ExecutorError::Panicked(panic_message(payload.as_ref())))??;

    let returned: BTreeSet<&str> = output
        .table
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    let declared: BTreeSet<&str> = expected.names().into_iter().collect();
    if returned != declared {
        let missing: Vec<_> = declared.difference(&returned).collect();
        let extra: Vec<_> = returned.difference(&declared).collect();
        return Err(DispatchError::SchemaMismatch(format!(
            "executor '{}' returned columns that differ from the plan: missing {:?}, unexpected {:?}",
            executor.name(),
            missing,
            extra
        )));
    }
    output.table = output
        .table
        .project(&expected.names())
        .map_err(|e| DispatchError::SchemaMismatch(e.to_string()))?;

    debug!(
        executor = executor.name(),
        dataset = %request.dataset,
        rows = output.table.num_rows(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "dispatched"
    );
    Ok(output)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CallbackExecutor, LocalExecutor};
    use prevega_core::config::SqlDialect;
    use prevega_core::schema::DataType;
    use prevega_core::types::{Column, Scalar, Table};

    fn table() -> Table {
        Table::try_new(vec![
            Column::new("a", DataType::Int64, vec![Scalar::I64(1)]),
            Column::new("b", DataType::Utf8, vec![Scalar::Str("x".into())]),
        ])
        .unwrap()
    }

    fn scan_request(executor: &dyn Executor) -> PlanRequest {
        let t = table();
        prepare(
            executor,
            "t",
            LogicalPlan::scan("t", t.schema()),
            HashMap::from([("t".to_string(), ScanInput::Inline(t))]),
        )
        .unwrap()
    }

    #[test]
    fn reorders_to_the_plan_schema() {
        let exec = CallbackExecutor::structured(|_| {
            Table::try_new(vec![
                Column::new("b", DataType::Utf8, vec![Scalar::Str("x".into())]),
                Column::new("a", DataType::Int64, vec![Scalar::I64(1)]),
            ])
            .map_err(|e| e.to_string())
        });
        let req = scan_request(&exec);
        let out = dispatch(&exec, &req, &table().schema()).unwrap();
        assert_eq!(out.table.schema().names(), vec!["a", "b"]);
    }

    #[test]
    fn column_set_differences_are_schema_mismatches() {
        let exec = CallbackExecutor::structured(|_| {
            Table::try_new(vec![Column::new("a", DataType::Int64, vec![Scalar::I64(1)])])
                .map_err(|e| e.to_string())
        });
        let req = scan_request(&exec);
        match dispatch(&exec, &req, &table().schema()) {
            Err(DispatchError::SchemaMismatch(msg)) => assert!(msg.contains("\"b\"")),
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn panics_become_executor_errors() {
        let exec = CallbackExecutor::structured(|_| panic!("kaboom"));
        let req = scan_request(&exec);
        match dispatch(&exec, &req, &table().schema()) {
            Err(DispatchError::Executor(ExecutorError::Panicked(msg))) => {
                assert_eq!(msg, "kaboom")
            }
            other => panic!("expected panic error, got {:?}", other),
        }
    }

    #[test]
    fn prepare_renders_for_the_executor() {
        let sql = CallbackExecutor::sql(SqlDialect::Generic, |_| Ok(Table::default()));
        let req = scan_request(&sql);
        assert!(req.rendered.unwrap().contains("VALUES"));

        let json = CallbackExecutor::json(|_| Ok(Table::default()));
        let req = scan_request(&json);
        let doc = RemotePlan::from_json(req.rendered.as_deref().unwrap()).unwrap();
        assert_eq!(doc.dataset, "t");
        assert!(doc.inputs.contains_key("t"));

        let req = scan_request(&LocalExecutor::new());
        assert!(req.rendered.is_none());
        let out = dispatch(&LocalExecutor::new(), &req, &table().schema()).unwrap();
        assert_eq!(out.table, table());
    }
}
