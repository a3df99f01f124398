//! Fold operator: one output row per (input row, folded field).

use prevega_core::schema::{DataType, Field, Schema};
use prevega_core::types::{Column, Scalar, Table};

use crate::traits::{EvalContext, OpError, Operator};

pub struct Fold {
    pub fields: Vec<String>,
    /// `(key, value)` output names.
    pub alias: (String, String),
}

impl Fold {
    fn value_type(&self, input: &Schema) -> Result<DataType, OpError> {
        let mut out: Option<DataType> = None;
        for f in &self.fields {
            let dt = input.require(f)?.data_type;
            out = Some(out.map(|o| o.unify(dt)).unwrap_or(dt));
        }
        out.ok_or_else(|| OpError::Plan("fold without fields".into()))
    }
}

impl Operator for Fold {
    fn name(&self) -> &'static str {
        "fold"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        let value_type = self.value_type(input)?;
        Ok(input
            .with_field(Field::new(self.alias.0.clone(), DataType::Utf8, false))
            .with_field(Field::new(self.alias.1.clone(), value_type, true)))
    }

    fn eval(&self, input: Table, _ctx: &mut EvalContext) -> Result<Table, OpError> {
        let value_type = self.value_type(&input.schema())?;
        let sources = self
            .fields
            .iter()
            .map(|f| input.require(f))
            .collect::<Result<Vec<_>, _>>()?;

        // Interleaved: row0/field0, row0/field1, row1/field0, ...
        let indices: Vec<usize> = (0..input.num_rows())
            .flat_map(|i| std::iter::repeat(i).take(self.fields.len()))
            .collect();
        let mut keys = Vec::with_capacity(indices.len());
        let mut values = Vec::with_capacity(indices.len());
        for i in 0..input.num_rows() {
            for (name, col) in self.fields.iter().zip(&sources) {
                keys.push(Scalar::Str(name.clone()));
                values.push(col.values[i].coerce(value_type));
            }
        }
        let mut out = input.take(&indices);
        out.set_column(Column::new(self.alias.0.clone(), DataType::Utf8, keys));
        out.set_column(Column::new(self.alias.1.clone(), value_type, values));
        Ok(out)
    }
}
