//! Hash aggregate with Vega semantics.
//!
//! Groups appear in order of first occurrence. Without group-by fields the
//! output always has exactly one row, even for empty input.

use std::collections::HashMap;

use prevega_core::dag::{AggregateExpr, AggregateOp};
use prevega_core::schema::{Field, Schema};
use prevega_core::types::{scalar_cmp, Scalar, Table};

use crate::traits::{EvalContext, OpError, Operator};

pub struct Aggregate {
    pub group_by: Vec<String>,
    pub aggs: Vec<AggregateExpr>,
}

impl Operator for Aggregate {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        let mut fields = self
            .group_by
            .iter()
            .map(|g| input.require(g).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        for agg in &self.aggs {
            let input_type = match &agg.field {
                Some(f) => Some(input.require(f)?.data_type),
                None => None,
            };
            fields.push(Field::new(
                agg.alias.clone(),
                agg.op.output_type(input_type),
                true,
            ));
        }
        Ok(Schema::try_new(fields)?)
    }

    fn eval(&self, input: Table, _ctx: &mut EvalContext) -> Result<Table, OpError> {
        let schema = self.plan(&input.schema())?;
        let keys = self
            .group_by
            .iter()
            .map(|g| input.require(g))
            .collect::<Result<Vec<_>, _>>()?;

        let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
        let mut buf = Vec::new();
        for row in 0..input.num_rows() {
            buf.clear();
            for col in &keys {
                col.values[row].encode_key(&mut buf);
            }
            match index.get(&buf) {
                Some(&g) => groups[g].1.push(row),
                None => {
                    index.insert(buf.clone(), groups.len());
                    groups.push((row, vec![row]));
                }
            }
        }
        if groups.is_empty() && self.group_by.is_empty() {
            groups.push((0, Vec::new()));
        }

        let mut out = Table::empty(&schema);
        for (first, rows) in &groups {
            for (col, key) in out.columns.iter_mut().zip(&keys) {
                col.values.push(key.values[*first].clone());
            }
            for (i, agg) in self.aggs.iter().enumerate() {
                let values: Vec<&Scalar> = match &agg.field {
                    Some(f) => {
                        let col = input.require(f)?;
                        rows.iter().map(|&r| &col.values[r]).collect()
                    }
                    None => Vec::new(),
                };
                let out_col = &mut out.columns[self.group_by.len() + i];
                let v = measure(agg.op, rows.len(), &values);
                out_col.values.push(v.coerce(out_col.data_type));
            }
        }
        Ok(out)
    }
}

/// One aggregate over a group. `count` is the group's row count; `values`
/// is empty for field-less ops.
pub fn measure(op: AggregateOp, count: usize, values: &[&Scalar]) -> Scalar {
    let valid = || values.iter().copied().filter(|v| v.is_valid());
    let numbers = || valid().filter_map(Scalar::as_f64).filter(|f| !f.is_nan());
    match op {
        AggregateOp::Count => Scalar::I64(count as i64),
        AggregateOp::Valid => Scalar::I64(valid().count() as i64),
        AggregateOp::Missing => Scalar::I64(values.iter().filter(|v| v.is_null()).count() as i64),
        AggregateOp::Distinct => {
            let mut seen = std::collections::HashSet::new();
            for v in values {
                let mut key = Vec::new();
                v.encode_key(&mut key);
                seen.insert(key);
            }
            Scalar::I64(seen.len() as i64)
        }
        AggregateOp::Sum => Scalar::F64(numbers().sum()),
        AggregateOp::Mean => {
            let (n, sum) = numbers().fold((0usize, 0.0), |(n, s), v| (n + 1, s + v));
            if n == 0 {
                Scalar::Null
            } else {
                Scalar::F64(sum / n as f64)
            }
        }
        AggregateOp::Min => valid()
            .min_by(|a, b| scalar_cmp(a, b))
            .cloned()
            .unwrap_or(Scalar::Null),
        AggregateOp::Max => valid()
            .max_by(|a, b| scalar_cmp(a, b))
            .cloned()
            .unwrap_or(Scalar::Null),
        AggregateOp::Variance | AggregateOp::Stdev => {
            let xs: Vec<f64> = numbers().collect();
            if xs.len() < 2 {
                return Scalar::Null;
            }
            let mean = xs.iter().sum::<f64>() / xs.len() as f64;
            let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
            if op == AggregateOp::Stdev {
                Scalar::F64(var.sqrt())
            } else {
                Scalar::F64(var)
            }
        }
        AggregateOp::Median => {
            let mut xs: Vec<f64> = numbers().collect();
            if xs.is_empty() {
                return Scalar::Null;
            }
            xs.sort_by(f64::total_cmp);
            let mid = xs.len() / 2;
            if xs.len() % 2 == 1 {
                Scalar::F64(xs[mid])
            } else {
                Scalar::F64((xs[mid - 1] + xs[mid]) / 2.0)
            }
        }
    }
}
