//! Project operator: select and rename columns.

use prevega_core::schema::{Field, Schema};
use prevega_core::types::{Column, Table};

use crate::traits::{EvalContext, OpError, Operator};

pub struct Project {
    /// `(source, alias)` pairs.
    pub columns: Vec<(String, String)>,
}

impl Operator for Project {
    fn name(&self) -> &'static str {
        "project"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        let fields = self
            .columns
            .iter()
            .map(|(src, alias)| {
                input
                    .require(src)
                    .map(|f| Field::new(alias.clone(), f.data_type, f.nullable))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Schema::try_new(fields)?)
    }

    fn eval(&self, input: Table, _ctx: &mut EvalContext) -> Result<Table, OpError> {
        let columns = self
            .columns
            .iter()
            .map(|(src, alias)| {
                input.require(src).map(|c| Column {
                    name: alias.clone(),
                    data_type: c.data_type,
                    values: c.values.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Table::try_new(columns)?)
    }
}
