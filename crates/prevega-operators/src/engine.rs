//! Recursive evaluation of a `LogicalPlan` with the local operators.

use std::collections::HashMap;

use tracing::trace;

use prevega_core::dag::LogicalPlan;
use prevega_core::schema::Schema;
use prevega_core::types::Table;

use crate::aggregate::Aggregate;
use crate::bin::{Bin, Extent};
use crate::filter::Filter;
use crate::fold::Fold;
use crate::formula::Formula;
use crate::project::Project;
use crate::sort::Sort;
use crate::stack::Stack;
use crate::timeunit::TimeUnit;
use crate::traits::{EvalContext, OpError, Operator};
use crate::window::Window;

/// Instantiate the operator for a non-scan node.
pub fn operator_for(node: &LogicalPlan) -> Option<Box<dyn Operator>> {
    let op: Box<dyn Operator> = match node {
        LogicalPlan::Scan { .. } => return None,
        LogicalPlan::Filter { predicate, .. } => Box::new(Filter {
            predicate: predicate.clone(),
        }),
        LogicalPlan::Formula { expr, alias, .. } => Box::new(Formula {
            expr: expr.clone(),
            alias: alias.clone(),
        }),
        LogicalPlan::Project { columns, .. } => Box::new(Project {
            columns: columns.clone(),
        }),
        LogicalPlan::Aggregate { group_by, aggs, .. } => Box::new(Aggregate {
            group_by: group_by.clone(),
            aggs: aggs.clone(),
        }),
        LogicalPlan::Extent { field, signal, .. } => Box::new(Extent {
            field: field.clone(),
            signal: signal.clone(),
        }),
        LogicalPlan::Bin {
            field,
            params,
            extent,
            alias,
            signal,
            ..
        } => Box::new(Bin {
            field: field.clone(),
            params: params.clone(),
            extent: extent.clone(),
            alias: alias.clone(),
            signal: signal.clone(),
        }),
        LogicalPlan::TimeUnit {
            field,
            units,
            timezone,
            alias,
            ..
        } => Box::new(TimeUnit {
            field: field.clone(),
            units: units.clone(),
            timezone: timezone.clone(),
            alias: alias.clone(),
        }),
        LogicalPlan::Window {
            group_by,
            order_by,
            frame,
            ignore_peers,
            functions,
            ..
        } => Box::new(Window {
            partitions: group_by.clone(),
            order_by: order_by.clone(),
            frame: *frame,
            ignore_peers: *ignore_peers,
            functions: functions.clone(),
        }),
        LogicalPlan::Stack {
            field,
            group_by,
            order_by,
            offset,
            alias,
            ..
        } => Box::new(Stack {
            field: field.clone(),
            group_by: group_by.clone(),
            order_by: order_by.clone(),
            offset: *offset,
            alias: alias.clone(),
        }),
        LogicalPlan::Fold { fields, alias, .. } => Box::new(Fold {
            fields: fields.clone(),
            alias: alias.clone(),
        }),
        LogicalPlan::Sort { keys, .. } => Box::new(Sort { keys: keys.clone() }),
    };
    Some(op)
}

/// Evaluate `plan` bottom-up. `scans` supplies the table for each scanned
/// dataset; signals published along the chain accumulate in `ctx`.
pub fn execute(
    plan: &LogicalPlan,
    scans: &HashMap<String, Table>,
    ctx: &mut EvalContext,
) -> Result<Table, OpError> {
    match (plan, plan.input()) {
        (LogicalPlan::Scan { dataset, schema }, _) => {
            let table = scans
                .get(dataset)
                .ok_or_else(|| OpError::Exec(format!("no input table for dataset '{}'", dataset)))?;
            conform(table, schema)
        }
        (node, Some(input)) => {
            let table = execute(input, scans, ctx)?;
            let op = operator_for(node)
                .ok_or_else(|| OpError::Plan(format!("no operator for {}", node.kind_name())))?;
            let rows_in = table.num_rows();
            let out = op.eval(table, ctx)?;
            let rows_out = out.num_rows();
            trace!(op = op.name(), rows_in, rows_out, "evaluated");
            Ok(out)
        }
        (node, None) => Err(OpError::Plan(format!(
            "{} node without input",
            node.kind_name()
        ))),
    }
}

/// Select the scan's declared columns, in declared order and types.
fn conform(table: &Table, schema: &Schema) -> Result<Table, OpError> {
    let names = schema.names();
    let mut out = table.project(&names)?;
    for (col, field) in out.columns.iter_mut().zip(&schema.fields) {
        if col.data_type != field.data_type {
            col.values = col
                .values
                .iter()
                .map(|v| v.coerce(field.data_type))
                .collect();
            col.data_type = field.data_type;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prevega_core::dag::{AggregateExpr, AggregateOp};
    use prevega_core::expr::Expr;
    use prevega_core::schema::{DataType, Field};
    use prevega_core::types::{Column, Scalar};

    #[test]
    fn evaluates_a_chain() {
        let schema = Schema::new(vec![
            Field::new("k", DataType::Utf8, false),
            Field::new("v", DataType::Int64, true),
        ]);
        let table = Table::try_new(vec![
            Column::new(
                "k",
                DataType::Utf8,
                ["a", "b", "a"].iter().map(|s| Scalar::Str(s.to_string())).collect(),
            ),
            Column::new(
                "v",
                DataType::Int64,
                vec![Scalar::I64(1), Scalar::I64(2), Scalar::I64(5)],
            ),
        ])
        .unwrap();
        let plan = LogicalPlan::Aggregate {
            input: Box::new(LogicalPlan::Filter {
                input: Box::new(LogicalPlan::scan("t", schema)),
                predicate: Expr::parse("datum.v != 2").unwrap(),
            }),
            group_by: vec!["k".into()],
            aggs: vec![AggregateExpr {
                op: AggregateOp::Sum,
                field: Some("v".into()),
                alias: "sum_v".into(),
            }],
        };
        let scans = HashMap::from([("t".to_string(), table)]);
        let out = execute(&plan, &scans, &mut EvalContext::new()).unwrap();
        assert_eq!(out.schema().names(), plan.schema().unwrap().names());
        assert_eq!(out.column("sum_v").unwrap().values, vec![Scalar::F64(6.0)]);
    }

    #[test]
    fn missing_scan_input_is_an_error() {
        let plan = LogicalPlan::scan("nope", Schema::default());
        assert!(execute(&plan, &HashMap::new(), &mut EvalContext::new()).is_err());
    }
}
