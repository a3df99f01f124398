use std::collections::HashMap;

use tracing::trace;

use prevega_core::types::Table;
use prevega_operators::{execute, EvalContext};
use prevega_planner::Capabilities;

use super::{Executor, ExecutorError, ExecutorOutput, PlanRequest, ScanInput};

/// The embedded engine: evaluates plans with `prevega-operators`.
///
/// External handles resolve against tables registered with `with_table`,
/// keyed by the handle's table name.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    tables: HashMap<String, Table>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, handle_table: impl Into<String>, table: Table) -> Self {
        self.tables.insert(handle_table.into(), table);
        self
    }

    fn scans(&self, request: &PlanRequest) -> Result<HashMap<String, Table>, ExecutorError> {
        request
            .inputs
            .iter()
            .map(|(dataset, input)| {
                let table = match input {
                    ScanInput::Inline(table) => table.clone(),
                    ScanInput::External(handle) => {
                        self.tables.get(&handle.table).cloned().ok_or_else(|| {
                            ExecutorError::Unresolvable(format!(
                                "external table '{}' for dataset '{}'",
                                handle.table, dataset
                            ))
                        })?
                    }
                };
                Ok((dataset.clone(), table))
            })
            .collect()
    }
}

impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn execute(&self, request: &PlanRequest) -> Result<ExecutorOutput, ExecutorError> {
        let scans = self.scans(request)?;
        let mut ctx = EvalContext::new();
        let table = execute(&request.plan, &scans, &mut ctx)
            .map_err(|e| ExecutorError::Failed(e.to_string()))?;
        trace!(dataset = %request.dataset, rows = table.num_rows(), "local plan evaluated");
        Ok(ExecutorOutput {
            table,
            signals: ctx.into_signals(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PlanFormat;
    use prevega_core::dag::LogicalPlan;
    use prevega_core::expr::Expr;
    use prevega_core::registry::ExternalHandle;
    use prevega_core::schema::DataType;
    use prevega_core::types::{Column, Scalar};
    use serde_json::json;

    fn numbers() -> Table {
        Table::try_new(vec![Column::new(
            "x",
            DataType::Int64,
            (1..=4).map(Scalar::I64).collect(),
        )])
        .unwrap()
    }

    fn request(input: ScanInput) -> PlanRequest {
        let plan = LogicalPlan::Filter {
            input: Box::new(LogicalPlan::scan("nums", numbers().schema())),
            predicate: Expr::parse("datum.x > 2").unwrap(),
        };
        PlanRequest {
            dataset: "nums".into(),
            plan,
            format: PlanFormat::Structured,
            rendered: None,
            inputs: HashMap::from([("nums".to_string(), input)]),
        }
    }

    #[test]
    fn evaluates_inline_scans() {
        let out = LocalExecutor::new()
            .execute(&request(ScanInput::Inline(numbers())))
            .unwrap();
        assert_eq!(
            out.table.to_json_rows(),
            vec![json!({"x": 3}), json!({"x": 4})]
        );
        assert!(out.signals.is_empty());
    }

    #[test]
    fn external_handles_need_a_registered_table() {
        let req = request(ScanInput::External(ExternalHandle::new("wh.nums")));
        let err = LocalExecutor::new().execute(&req).unwrap_err();
        assert!(matches!(err, ExecutorError::Unresolvable(_)));

        let out = LocalExecutor::new()
            .with_table("wh.nums", numbers())
            .execute(&req)
            .unwrap();
        assert_eq!(out.table.num_rows(), 2);
    }
}
