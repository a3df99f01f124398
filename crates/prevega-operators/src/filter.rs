//! Filter operator: keeps rows whose predicate is truthy.

use prevega_core::expr::Expr;
use prevega_core::prelude::Schema;
use prevega_core::types::Table;

use crate::traits::{EvalContext, OpError, Operator};

pub struct Filter {
    pub predicate: Expr,
}

impl Operator for Filter {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        self.predicate.data_type(input)?;
        Ok(input.clone())
    }

    fn eval(&self, input: Table, _ctx: &mut EvalContext) -> Result<Table, OpError> {
        let mut keep = Vec::with_capacity(input.num_rows());
        for i in 0..input.num_rows() {
            if self.predicate.evaluate(&input.row(i))?.truthy() {
                keep.push(i);
            }
        }
        if keep.len() == input.num_rows() {
            return Ok(input);
        }
        Ok(input.take(&keep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prevega_core::schema::DataType;
    use prevega_core::types::{Column, Scalar};

    #[test]
    fn keeps_truthy_rows_and_drops_nulls() {
        let table = Table::try_new(vec![Column::new(
            "x",
            DataType::Int64,
            vec![Scalar::I64(1), Scalar::Null, Scalar::I64(5)],
        )])
        .unwrap();
        let op = Filter {
            predicate: Expr::parse("datum.x > 2").unwrap(),
        };
        let out = op.eval(table, &mut EvalContext::new()).unwrap();
        assert_eq!(out.column("x").unwrap().values, vec![Scalar::I64(5)]);
    }
}
