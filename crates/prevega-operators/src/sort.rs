//! Sort operator (from `collect`): stable, nulls first ascending.

use prevega_core::dag::SortKey;
use prevega_core::schema::Schema;
use prevega_core::types::Table;

use crate::traits::{EvalContext, OpError, Operator};

pub struct Sort {
    pub keys: Vec<SortKey>,
}

impl Operator for Sort {
    fn name(&self) -> &'static str {
        "sort"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        for k in &self.keys {
            input.require(&k.field)?;
        }
        Ok(input.clone())
    }

    fn eval(&self, mut input: Table, _ctx: &mut EvalContext) -> Result<Table, OpError> {
        input.sort_by_keys(&self.keys)?;
        Ok(input)
    }
}
