//! `extent` and `bin` operators, the two that publish signals.

use serde_json::{json, Value};

use prevega_core::dag::{BinExtent, BinParams, BinSpec};
use prevega_core::schema::{DataType, Field, Schema};
use prevega_core::types::{scalar_cmp, Column, Scalar, Table};

use crate::traits::{EvalContext, OpError, Operator};

/// Passes rows through and publishes `[min, max]` of `field`.
pub struct Extent {
    pub field: String,
    pub signal: String,
}

impl Extent {
    pub fn compute(table: &Table, field: &str) -> Result<(Scalar, Scalar), OpError> {
        let col = table.require(field)?;
        let valid = col.values.iter().filter(|v| v.is_valid());
        let min = valid.clone().min_by(|a, b| scalar_cmp(a, b)).cloned();
        let max = valid.max_by(|a, b| scalar_cmp(a, b)).cloned();
        Ok((min.unwrap_or(Scalar::Null), max.unwrap_or(Scalar::Null)))
    }
}

impl Operator for Extent {
    fn name(&self) -> &'static str {
        "extent"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        input.require(&self.field)?;
        Ok(input.clone())
    }

    fn eval(&self, input: Table, ctx: &mut EvalContext) -> Result<Table, OpError> {
        let (min, max) = Self::compute(&input, &self.field)?;
        ctx.publish(self.signal.clone(), json!([min.to_json(), max.to_json()]));
        Ok(input)
    }
}

pub struct Bin {
    pub field: String,
    pub params: BinParams,
    pub extent: BinExtent,
    pub alias: (String, String),
    pub signal: Option<String>,
}

impl Bin {
    /// `None` when the extent came from a column with no valid values.
    fn extent(&self, ctx: &EvalContext) -> Result<Option<(f64, f64)>, OpError> {
        match &self.extent {
            BinExtent::Literal(lo, hi) => Ok(Some((*lo, *hi))),
            BinExtent::Signal(name) => {
                let value = ctx.signal(name).ok_or_else(|| {
                    OpError::Exec(format!("extent signal '{}' was not published", name))
                })?;
                match value.as_array().map(|a| a.as_slice()) {
                    Some([Value::Null, Value::Null]) => Ok(None),
                    Some([lo, hi]) => match (lo.as_f64(), hi.as_f64()) {
                        (Some(lo), Some(hi)) => Ok(Some((lo, hi))),
                        _ => Err(OpError::Exec(format!(
                            "extent signal '{}' is not numeric: {}",
                            name, value
                        ))),
                    },
                    _ => Err(OpError::Exec(format!(
                        "extent signal '{}' is not a pair: {}",
                        name, value
                    ))),
                }
            }
        }
    }

    /// Value published on `signal`, shaped like Vega's bin signal.
    pub fn signal_value(&self, spec: &BinSpec) -> Value {
        json!({
            "fields": [self.field],
            "fname": format!("bin_{}", self.field),
            "start": spec.start,
            "step": spec.step,
            "stop": spec.stop,
        })
    }
}

impl Operator for Bin {
    fn name(&self) -> &'static str {
        "bin"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        input.require(&self.field)?;
        Ok(input
            .with_field(Field::new(self.alias.0.clone(), DataType::Float64, true))
            .with_field(Field::new(self.alias.1.clone(), DataType::Float64, true)))
    }

    fn eval(&self, mut input: Table, ctx: &mut EvalContext) -> Result<Table, OpError> {
        let Some(extent) = self.extent(ctx)? else {
            // Nothing to bin: every row gets null boundaries and no signal.
            let nulls = vec![Scalar::Null; input.num_rows()];
            input.set_column(Column::new(self.alias.0.clone(), DataType::Float64, nulls.clone()));
            input.set_column(Column::new(self.alias.1.clone(), DataType::Float64, nulls));
            return Ok(input);
        };
        let spec = self.params.resolve(extent)?;
        let col = input.require(&self.field)?;
        let mut bin0 = Vec::with_capacity(col.len());
        let mut bin1 = Vec::with_capacity(col.len());
        for v in &col.values {
            match v.as_f64().filter(|f| !f.is_nan()) {
                Some(f) => {
                    let b = spec.bin0(f);
                    bin0.push(Scalar::F64(b));
                    bin1.push(Scalar::F64(b + spec.step));
                }
                None => {
                    bin0.push(Scalar::Null);
                    bin1.push(Scalar::Null);
                }
            }
        }
        input.set_column(Column::new(self.alias.0.clone(), DataType::Float64, bin0));
        input.set_column(Column::new(self.alias.1.clone(), DataType::Float64, bin1));
        if let Some(signal) = &self.signal {
            ctx.publish(signal.clone(), self.signal_value(&spec));
        }
        Ok(input)
    }
}
