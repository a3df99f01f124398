use std::collections::HashMap;

use prevega_core::dag::{SortKey, WindowFrame, WindowFunction, WindowOp};
use prevega_core::prelude::{Field, Schema};
use prevega_core::types::{scalar_cmp, scalar_tuple_cmp, Column, Scalar, Table};

use crate::traits::{EvalContext, OpError, Operator};

/// Vega `window`: per-partition ranking, offset and framed aggregate
/// functions. Output rows keep their input order.
#[derive(Debug, Default, Clone)]
pub struct Window {
    pub partitions: Vec<String>,
    pub order_by: Vec<SortKey>,
    pub frame: WindowFrame,
    pub ignore_peers: bool,
    pub functions: Vec<WindowFunction>,
}

impl Operator for Window {
    fn name(&self) -> &'static str {
        "window"
    }

    fn plan(&self, input: &Schema) -> Result<Schema, OpError> {
        for p in &self.partitions {
            input.require(p)?;
        }
        for k in &self.order_by {
            input.require(&k.field)?;
        }
        let mut schema = input.clone();
        for spec in &self.functions {
            let input_type = match &spec.field {
                Some(f) => Some(input.require(f)?.data_type),
                None => None,
            };
            schema = schema.with_field(Field::new(
                spec.alias.clone(),
                spec.op.output_type(input_type),
                true,
            ));
        }
        Ok(schema)
    }

    fn eval(&self, mut input: Table, _ctx: &mut EvalContext) -> Result<Table, OpError> {
        let output_schema = self.plan(&input.schema())?;
        let num_rows = input.num_rows();

        let mut name_to_index = HashMap::new();
        for (idx, col) in input.columns.iter().enumerate() {
            name_to_index.insert(col.name.clone(), idx);
        }

        // Partition columns first (always ascending), then the window order.
        let mut keys: Vec<SortKey> = self.partitions.iter().map(SortKey::asc).collect();
        keys.extend(self.order_by.iter().cloned());
        let order_indices = input.sorted_indices(&keys)?;

        let mut partitions: Vec<Vec<usize>> = Vec::new();
        let mut current_partition: Vec<Scalar> = Vec::new();
        for (pos, &row) in order_indices.iter().enumerate() {
            let part_key = extract_key(&input, &self.partitions, row, &name_to_index)?;
            if pos == 0 || part_key != current_partition {
                current_partition = part_key;
                partitions.push(Vec::new());
            }
            if let Some(p) = partitions.last_mut() {
                p.push(row);
            }
        }

        let mut computed_columns: Vec<Vec<Scalar>> = self
            .functions
            .iter()
            .map(|_| vec![Scalar::Null; num_rows])
            .collect();

        let order_names: Vec<String> = self.order_by.iter().map(|k| k.field.clone()).collect();
        for rows in &partitions {
            let peers = peer_groups(&input, &order_names, rows, &name_to_index)?;
            for (fn_idx, spec) in self.functions.iter().enumerate() {
                let values: Vec<&Scalar> = match &spec.field {
                    Some(f) => {
                        let col = &input.columns[*name_to_index.get(f).ok_or_else(|| {
                            OpError::Schema(format!("window column '{f}' not found"))
                        })?];
                        rows.iter().map(|&r| &col.values[r]).collect()
                    }
                    None => Vec::new(),
                };
                for (i, &row) in rows.iter().enumerate() {
                    computed_columns[fn_idx][row] =
                        self.compute(spec, i, rows.len(), &peers, &values);
                }
            }
        }

        for (spec, values) in self.functions.iter().zip(computed_columns) {
            let dt = output_schema.require(&spec.alias)?.data_type;
            input.set_column(Column::new(
                spec.alias.clone(),
                dt,
                values.into_iter().map(|v| v.coerce(dt)).collect(),
            ));
        }
        Ok(input)
    }
}

impl Window {
    /// Frame of row `i` as an inclusive index range into the partition.
    fn frame_bounds(&self, i: usize, len: usize, peers: &Peers) -> Option<(usize, usize)> {
        let (lo, hi) = self.frame.bounds(i, len)?;
        if self.ignore_peers || self.order_by.is_empty() {
            return Some((lo, hi));
        }
        Some((peers.start[lo], peers.end[hi]))
    }

    fn compute(
        &self,
        spec: &WindowFunction,
        i: usize,
        len: usize,
        peers: &Peers,
        values: &[&Scalar],
    ) -> Scalar {
        let offset = spec.param.unwrap_or(1).max(0) as usize;
        match spec.op {
            WindowOp::RowNumber => Scalar::I64(i as i64 + 1),
            WindowOp::Rank => Scalar::I64(peers.start[i] as i64 + 1),
            WindowOp::DenseRank => Scalar::I64(peers.rank[i] as i64 + 1),
            WindowOp::Lag => i
                .checked_sub(offset)
                .map(|j| values[j].clone())
                .unwrap_or(Scalar::Null),
            WindowOp::Lead => values
                .get(i + offset)
                .map(|v| (*v).clone())
                .unwrap_or(Scalar::Null),
            op => {
                let Some((lo, hi)) = self.frame_bounds(i, len, peers) else {
                    return match op {
                        WindowOp::Count => Scalar::I64(0),
                        WindowOp::Sum => Scalar::F64(0.0),
                        _ => Scalar::Null,
                    };
                };
                let frame = || values[lo..=hi].iter().copied();
                let numbers = || {
                    frame()
                        .filter(|v| v.is_valid())
                        .filter_map(Scalar::as_f64)
                        .filter(|f| !f.is_nan())
                };
                match op {
                    WindowOp::FirstValue => values[lo].clone(),
                    WindowOp::LastValue => values[hi].clone(),
                    WindowOp::Count => Scalar::I64((hi - lo + 1) as i64),
                    WindowOp::Sum => Scalar::F64(numbers().sum()),
                    WindowOp::Mean => {
                        let (n, sum) = numbers().fold((0usize, 0.0), |(n, s), v| (n + 1, s + v));
                        if n == 0 {
                            Scalar::Null
                        } else {
                            Scalar::F64(sum / n as f64)
                        }
                    }
                    WindowOp::Min => frame()
                        .filter(|v| v.is_valid())
                        .min_by(|a, b| scalar_cmp(a, b))
                        .cloned()
                        .unwrap_or(Scalar::Null),
                    WindowOp::Max => frame()
                        .filter(|v| v.is_valid())
                        .max_by(|a, b| scalar_cmp(a, b))
                        .cloned()
                        .unwrap_or(Scalar::Null),
                    _ => Scalar::Null,
                }
            }
        }
    }
}

/// Peer structure of one sorted partition: for each position, the first and
/// last position sharing its order key, and the dense rank of that key.
/// Without an order every row is its own peer group.
struct Peers {
    start: Vec<usize>,
    end: Vec<usize>,
    rank: Vec<usize>,
}

fn peer_groups(
    batch: &Table,
    order: &[String],
    rows: &[usize],
    name_map: &HashMap<String, usize>,
) -> Result<Peers, OpError> {
    let n = rows.len();
    let mut peers = Peers {
        start: vec![0; n],
        end: vec![0; n],
        rank: vec![0; n],
    };
    let mut prev: Option<Vec<Scalar>> = None;
    let mut group_start = 0;
    let mut dense = 0;
    for (i, &row) in rows.iter().enumerate() {
        let key = extract_key(batch, order, row, name_map)?;
        let tied = !order.is_empty()
            && prev
                .as_ref()
                .map(|p| scalar_tuple_cmp(p, &key).is_eq())
                .unwrap_or(false);
        if !tied {
            if i > 0 {
                for e in &mut peers.end[group_start..i] {
                    *e = i - 1;
                }
                dense += 1;
            }
            group_start = i;
        }
        peers.start[i] = group_start;
        peers.rank[i] = dense;
        prev = Some(key);
    }
    if n > 0 {
        for e in &mut peers.end[group_start..n] {
            *e = n - 1;
        }
    }
    Ok(peers)
}

fn extract_key(
    batch: &Table,
    names: &[String],
    row_idx: usize,
    name_map: &HashMap<String, usize>,
) -> Result<Vec<Scalar>, OpError> {
    let mut key = Vec::with_capacity(names.len());
    for name in names {
        let idx = name_map
            .get(name)
            .ok_or_else(|| OpError::Schema(format!("window key column '{name}' not found")))?;
        key.push(batch.columns[*idx].values[row_idx].clone());
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prevega_core::schema::DataType;

    fn table() -> Table {
        Table::try_new(vec![
            Column::new(
                "g",
                DataType::Utf8,
                ["x", "y", "x", "x", "y"].iter().map(|s| Scalar::Str(s.to_string())).collect(),
            ),
            Column::new(
                "v",
                DataType::Int64,
                vec![
                    Scalar::I64(3),
                    Scalar::I64(10),
                    Scalar::I64(1),
                    Scalar::I64(3),
                    Scalar::I64(20),
                ],
            ),
        ])
        .unwrap()
    }

    fn func(op: WindowOp, field: Option<&str>, alias: &str) -> WindowFunction {
        WindowFunction {
            op,
            field: field.map(str::to_string),
            param: None,
            alias: alias.into(),
        }
    }

    fn ints(t: &Table, name: &str) -> Vec<i64> {
        t.column(name)
            .unwrap()
            .values
            .iter()
            .map(|v| match v {
                Scalar::I64(i) => *i,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn ranks_within_partitions_in_input_order() {
        let op = Window {
            partitions: vec!["g".into()],
            order_by: vec![SortKey::asc("v")],
            functions: vec![
                func(WindowOp::RowNumber, None, "row_number"),
                func(WindowOp::Rank, None, "rank"),
                func(WindowOp::DenseRank, None, "dense_rank"),
            ],
            ..Window::default()
        };
        let out = op.eval(table(), &mut EvalContext::new()).unwrap();
        // Partition x sorted: v=1 (row 2), v=3 (rows 0 and 3, tied).
        assert_eq!(ints(&out, "row_number"), vec![2, 1, 1, 3, 2]);
        assert_eq!(ints(&out, "rank"), vec![2, 1, 1, 2, 2]);
        assert_eq!(ints(&out, "dense_rank"), vec![2, 1, 1, 2, 2]);
    }

    #[test]
    fn running_sum_includes_peers_unless_ignored() {
        let mut op = Window {
            partitions: vec!["g".into()],
            order_by: vec![SortKey::asc("v")],
            functions: vec![func(WindowOp::Sum, Some("v"), "sum_v")],
            ..Window::default()
        };
        let out = op.eval(table(), &mut EvalContext::new()).unwrap();
        let sums: Vec<f64> = out
            .column("sum_v")
            .unwrap()
            .values
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        assert_eq!(sums, vec![7.0, 10.0, 1.0, 7.0, 30.0]);

        op.ignore_peers = true;
        let out = op.eval(table(), &mut EvalContext::new()).unwrap();
        let sums: Vec<f64> = out
            .column("sum_v")
            .unwrap()
            .values
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        assert_eq!(sums, vec![4.0, 10.0, 1.0, 7.0, 30.0]);
    }

    #[test]
    fn lag_and_lead_respect_partitions() {
        let mut lag = func(WindowOp::Lag, Some("v"), "prev");
        lag.param = Some(1);
        let op = Window {
            partitions: vec!["g".into()],
            order_by: vec![SortKey::asc("v")],
            functions: vec![lag, func(WindowOp::Lead, Some("v"), "next")],
            ..Window::default()
        };
        let out = op.eval(table(), &mut EvalContext::new()).unwrap();
        assert_eq!(
            out.column("prev").unwrap().values,
            vec![Scalar::I64(1), Scalar::Null, Scalar::Null, Scalar::I64(3), Scalar::I64(10)]
        );
        assert_eq!(
            out.column("next").unwrap().values,
            vec![Scalar::I64(3), Scalar::I64(20), Scalar::I64(3), Scalar::Null, Scalar::Null]
        );
    }
}
