//! Formula operator: adds (or overwrites) one computed column.

use prevega_core::expr::Expr;
use prevega_core::schema::{Field, Schema};
use prevega_core::types::{Column, Table};

use crate::traits::{EvalContext, OpError, Operator};

pub struct Formula {
    pub expr: Expr,
    pub alias: String,
}

impl Operator for Formula {
    fn name(&self) -> &'static str {
        "formula"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        let dt = self.expr.data_type(input)?;
        Ok(input.with_field(Field::new(self.alias.clone(), dt, true)))
    }

    fn eval(&self, mut input: Table, _ctx: &mut EvalContext) -> Result<Table, OpError> {
        let dt = self.expr.data_type(&input.schema())?;
        let values = (0..input.num_rows())
            .map(|i| self.expr.evaluate(&input.row(i)).map(|v| v.coerce(dt)))
            .collect::<Result<Vec<_>, _>>()?;
        input.set_column(Column::new(self.alias.clone(), dt, values));
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prevega_core::schema::DataType;
    use prevega_core::types::Scalar;

    #[test]
    fn overwrites_in_place() {
        let table = Table::try_new(vec![
            Column::new("a", DataType::Int64, vec![Scalar::I64(2)]),
            Column::new("b", DataType::Utf8, vec![Scalar::Str("x".into())]),
        ])
        .unwrap();
        let op = Formula {
            expr: Expr::parse("datum.a * 10").unwrap(),
            alias: "a".into(),
        };
        let out = op.eval(table, &mut EvalContext::new()).unwrap();
        assert_eq!(out.schema().names(), vec!["a", "b"]);
        assert_eq!(out.column("a").unwrap().values, vec![Scalar::F64(20.0)]);
        assert_eq!(out.column("a").unwrap().data_type, DataType::Float64);
    }
}
