//! `stack` operator: running layout offsets per group.
//!
//! Rows keep their input order; `sort` only decides the stacking order
//! inside each group.

use std::collections::HashMap;

use prevega_core::dag::{SortKey, StackOffset};
use prevega_core::schema::{DataType, Field, Schema};
use prevega_core::types::{Column, Scalar, Table};

use crate::traits::{EvalContext, OpError, Operator};

pub struct Stack {
    pub field: String,
    pub group_by: Vec<String>,
    pub order_by: Vec<SortKey>,
    pub offset: StackOffset,
    pub alias: (String, String),
}

impl Stack {
    /// Row indices per group, groups in first-appearance order, rows in
    /// stacking order.
    fn groups(&self, input: &Table) -> Result<Vec<Vec<usize>>, OpError> {
        let order = input.sorted_indices(&self.order_by)?;
        let keys = self
            .group_by
            .iter()
            .map(|g| input.require(g))
            .collect::<Result<Vec<_>, _>>()?;

        let mut first_seen: HashMap<Vec<u8>, usize> = HashMap::new();
        for row in 0..input.num_rows() {
            let mut key = Vec::new();
            for col in &keys {
                col.values[row].encode_key(&mut key);
            }
            let next = first_seen.len();
            first_seen.entry(key).or_insert(next);
        }
        let mut groups = vec![Vec::new(); first_seen.len()];
        for row in order {
            let mut key = Vec::new();
            for col in &keys {
                col.values[row].encode_key(&mut key);
            }
            if let Some(&g) = first_seen.get(&key) {
                groups[g].push(row);
            }
        }
        Ok(groups)
    }
}

impl Operator for Stack {
    fn name(&self) -> &'static str {
        "stack"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        input.require(&self.field)?;
        for g in &self.group_by {
            input.require(g)?;
        }
        Ok(input
            .with_field(Field::new(self.alias.0.clone(), DataType::Float64, true))
            .with_field(Field::new(self.alias.1.clone(), DataType::Float64, true)))
    }

    fn eval(&self, mut input: Table, _ctx: &mut EvalContext) -> Result<Table, OpError> {
        let groups = self.groups(&input)?;
        let col = input.require(&self.field)?;
        let value = |row: usize| {
            col.values[row]
                .as_f64()
                .filter(|f| f.is_finite())
                .unwrap_or(0.0)
        };

        let n = input.num_rows();
        let mut y0 = vec![Scalar::Null; n];
        let mut y1 = vec![Scalar::Null; n];
        let totals: Vec<f64> = groups
            .iter()
            .map(|rows| rows.iter().map(|&r| value(r).abs()).sum())
            .collect();
        let max_total = totals.iter().copied().fold(0.0, f64::max);

        for (rows, total) in groups.iter().zip(&totals) {
            match self.offset {
                StackOffset::Zero => {
                    let (mut pos, mut neg) = (0.0, 0.0);
                    for &r in rows {
                        let v = value(r);
                        let running = if v < 0.0 { &mut neg } else { &mut pos };
                        y0[r] = Scalar::F64(*running);
                        *running += v;
                        y1[r] = Scalar::F64(*running);
                    }
                }
                StackOffset::Center | StackOffset::Normalize => {
                    let (mut last, scale) = match self.offset {
                        StackOffset::Center => ((max_total - total) / 2.0, 1.0),
                        _ if *total > 0.0 => (0.0, 1.0 / total),
                        _ => (0.0, 0.0),
                    };
                    for &r in rows {
                        y0[r] = Scalar::F64(last);
                        last += scale * value(r).abs();
                        y1[r] = Scalar::F64(last);
                    }
                }
            }
        }

        input.set_column(Column::new(self.alias.0.clone(), DataType::Float64, y0));
        input.set_column(Column::new(self.alias.1.clone(), DataType::Float64, y1));
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::try_new(vec![
            Column::new(
                "g",
                DataType::Utf8,
                ["a", "a", "b", "a"].iter().map(|s| Scalar::Str(s.to_string())).collect(),
            ),
            Column::new(
                "v",
                DataType::Int64,
                vec![Scalar::I64(2), Scalar::I64(-1), Scalar::I64(4), Scalar::I64(3)],
            ),
        ])
        .unwrap()
    }

    fn stack(offset: StackOffset) -> Stack {
        Stack {
            field: "v".into(),
            group_by: vec!["g".into()],
            order_by: vec![],
            offset,
            alias: ("y0".into(), "y1".into()),
        }
    }

    fn floats(t: &Table, name: &str) -> Vec<f64> {
        t.column(name)
            .unwrap()
            .values
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect()
    }

    #[test]
    fn zero_offset_separates_signs() {
        let out = stack(StackOffset::Zero)
            .eval(table(), &mut EvalContext::new())
            .unwrap();
        assert_eq!(floats(&out, "y0"), vec![0.0, 0.0, 0.0, 2.0]);
        assert_eq!(floats(&out, "y1"), vec![2.0, -1.0, 4.0, 5.0]);
    }

    #[test]
    fn normalize_and_center() {
        let out = stack(StackOffset::Normalize)
            .eval(table(), &mut EvalContext::new())
            .unwrap();
        let expected = [2.0 / 6.0, 3.0 / 6.0, 1.0, 1.0];
        for (got, want) in floats(&out, "y1").iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{} vs {}", got, want);
        }

        let out = stack(StackOffset::Center)
            .eval(table(), &mut EvalContext::new())
            .unwrap();
        // Group a totals 6, group b 4: b is shifted by (6 - 4) / 2.
        assert_eq!(floats(&out, "y0")[2], 1.0);
        assert_eq!(floats(&out, "y1")[2], 5.0);
    }
}
