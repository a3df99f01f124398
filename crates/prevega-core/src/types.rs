//! Scalar values and the columnar `Table` exchanged between executors.
//!
//! A `Table` is a list of typed columns of equal length. Values are held as
//! `Scalar`s; integer columns of every width share `Scalar::I64`, float
//! columns share `Scalar::F64`, and the declared width lives in the column's
//! `DataType`.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};
use crate::expr::RowAccess;
use crate::schema::{DataType, Field, Schema};

pub const MS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    /// Days since epoch.
    Date32(i32),
    /// Milliseconds since epoch.
    Timestamp(i64),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// The natural column type for this value; `None` for `Null`.
    pub fn data_type(&self) -> Option<DataType> {
        Some(match self {
            Scalar::Null => return None,
            Scalar::Bool(_) => DataType::Boolean,
            Scalar::I64(_) => DataType::Int64,
            Scalar::F64(_) => DataType::Float64,
            Scalar::Str(_) => DataType::Utf8,
            Scalar::Date32(_) => DataType::Date32,
            Scalar::Timestamp(_) => DataType::Timestamp,
        })
    }

    /// Numeric view of the value. Temporal values become epoch milliseconds,
    /// booleans 0/1, unparsable strings NaN. `None` only for `Null`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Null => None,
            Scalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Scalar::I64(i) => Some(*i as f64),
            Scalar::F64(f) => Some(*f),
            Scalar::Str(s) => Some(s.trim().parse::<f64>().unwrap_or(f64::NAN)),
            Scalar::Date32(d) => Some(*d as f64 * MS_PER_DAY as f64),
            Scalar::Timestamp(ms) => Some(*ms as f64),
        }
    }

    /// Epoch milliseconds for temporal and numeric values.
    pub fn as_epoch_ms(&self) -> Option<i64> {
        match self {
            Scalar::Timestamp(ms) => Some(*ms),
            Scalar::Date32(d) => Some(*d as i64 * MS_PER_DAY),
            Scalar::I64(i) => Some(*i),
            Scalar::F64(f) if f.is_finite() => Some(f.floor() as i64),
            Scalar::Str(s) => parse_datetime_ms(s),
            _ => None,
        }
    }

    /// JavaScript-style truthiness.
    pub fn truthy(&self) -> bool {
        match self {
            Scalar::Null => false,
            Scalar::Bool(b) => *b,
            Scalar::I64(i) => *i != 0,
            Scalar::F64(f) => *f != 0.0 && !f.is_nan(),
            Scalar::Str(s) => !s.is_empty(),
            Scalar::Date32(_) | Scalar::Timestamp(_) => true,
        }
    }

    /// True for non-null values that are not NaN (Vega's notion of "valid").
    pub fn is_valid(&self) -> bool {
        match self {
            Scalar::Null => false,
            Scalar::F64(f) => !f.is_nan(),
            _ => true,
        }
    }

    /// String rendering following JavaScript's `String(v)` for the common cases.
    pub fn to_display_string(&self) -> String {
        match self {
            Scalar::Null => "null".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::I64(i) => i.to_string(),
            Scalar::F64(f) => format_number(*f),
            Scalar::Str(s) => s.clone(),
            Scalar::Date32(d) => (*d as i64 * MS_PER_DAY).to_string(),
            Scalar::Timestamp(ms) => ms.to_string(),
        }
    }

    /// Convert the value to the representation used by a column of type `dt`.
    /// Values that cannot be converted become `Null`.
    pub fn coerce(&self, dt: DataType) -> Scalar {
        if self.is_null() {
            return Scalar::Null;
        }
        match dt {
            DataType::Boolean => match self {
                Scalar::Bool(b) => Scalar::Bool(*b),
                Scalar::Str(s) => match s.as_str() {
                    "true" => Scalar::Bool(true),
                    "false" => Scalar::Bool(false),
                    _ => Scalar::Null,
                },
                other => Scalar::Bool(other.truthy()),
            },
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => match self {
                Scalar::I64(i) => Scalar::I64(*i),
                Scalar::Timestamp(_) | Scalar::Date32(_) => {
                    self.as_epoch_ms().map(Scalar::I64).unwrap_or(Scalar::Null)
                }
                other => match other.as_f64() {
                    Some(f) if f.is_finite() => Scalar::I64(f.trunc() as i64),
                    _ => Scalar::Null,
                },
            },
            DataType::Float32 | DataType::Float64 => match self.as_f64() {
                Some(f) => Scalar::F64(f),
                None => Scalar::Null,
            },
            DataType::Utf8 => Scalar::Str(self.to_display_string()),
            DataType::Date32 => match self {
                Scalar::Date32(d) => Scalar::Date32(*d),
                other => other
                    .as_epoch_ms()
                    .map(|ms| Scalar::Date32(ms.div_euclid(MS_PER_DAY) as i32))
                    .unwrap_or(Scalar::Null),
            },
            DataType::Timestamp => self
                .as_epoch_ms()
                .map(Scalar::Timestamp)
                .unwrap_or(Scalar::Null),
        }
    }

    /// Decode a JSON value. Nested arrays/objects are kept as their JSON text.
    pub fn from_json(value: &Value) -> Scalar {
        match value {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::I64(i),
                None => Scalar::F64(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Scalar::Str(s.clone()),
            other => Scalar::Str(other.to_string()),
        }
    }

    /// Encode as JSON. Temporal values become epoch milliseconds (what a Vega
    /// client expects for inline dates); non-finite floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::I64(i) => Value::Number((*i).into()),
            Scalar::F64(f) => Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Str(s) => Value::String(s.clone()),
            Scalar::Date32(d) => Value::Number((*d as i64 * MS_PER_DAY).into()),
            Scalar::Timestamp(ms) => Value::Number((*ms).into()),
        }
    }

    /// Append a type-tagged byte encoding of this value to `buf`; equal values
    /// produce equal encodings. Used as a group key.
    pub fn encode_key(&self, buf: &mut Vec<u8>) {
        buf.push(scalar_type_order(self));
        match self {
            Scalar::Null => {}
            Scalar::Bool(b) => buf.push(*b as u8),
            Scalar::I64(i) => buf.extend_from_slice(&i.to_le_bytes()),
            Scalar::F64(f) => {
                // Normalize -0.0 and NaN payloads
                let f = if *f == 0.0 { 0.0 } else { *f };
                let bits = if f.is_nan() { f64::NAN.to_bits() } else { f.to_bits() };
                buf.extend_from_slice(&bits.to_le_bytes());
            }
            Scalar::Str(s) => {
                buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Scalar::Date32(d) => buf.extend_from_slice(&d.to_le_bytes()),
            Scalar::Timestamp(ms) => buf.extend_from_slice(&ms.to_le_bytes()),
        }
    }
}

/// Format a float the way JavaScript prints numbers for integral values.
fn format_number(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e21 {
        format!("{}", f as i64)
    } else if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{}", f)
    }
}

/// Parse ISO-8601 dates/datetimes into epoch milliseconds (UTC).
pub fn parse_datetime_ms(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ndt.and_utc().timestamp_millis());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ndt.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc().timestamp_millis())
}

/// Total order used by sort, window and min/max.
///
/// Nulls sort first, numeric and temporal values compare numerically across
/// representations, NaN sorts after all numbers.
pub fn scalar_cmp(a: &Scalar, b: &Scalar) -> Ordering {
    use Scalar::*;

    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Bool(x), Bool(y)) => x.cmp(y),
        (I64(x), I64(y)) => x.cmp(y),
        (Str(x), Str(y)) => x.cmp(y),
        (Date32(x), Date32(y)) => x.cmp(y),
        (Timestamp(x), Timestamp(y)) => x.cmp(y),
        (Str(_), _) | (_, Str(_)) | (Bool(_), _) | (_, Bool(_)) => {
            scalar_type_order(a).cmp(&scalar_type_order(b))
        }
        _ => {
            // Remaining pairs are numeric/temporal.
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            if x.is_nan() && y.is_nan() {
                Ordering::Equal
            } else if x.is_nan() {
                Ordering::Greater
            } else if y.is_nan() {
                Ordering::Less
            } else {
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        }
    }
}

/// Compare two scalar tuples lexicographically.
pub fn scalar_tuple_cmp(a: &[Scalar], b: &[Scalar]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match scalar_cmp(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Assign a numeric order to scalar types for mixed-type comparisons.
fn scalar_type_order(s: &Scalar) -> u8 {
    use Scalar::*;
    match s {
        Null => 0,
        Bool(_) => 1,
        I64(_) => 2,
        F64(_) => 3,
        Date32(_) => 4,
        Timestamp(_) => 5,
        Str(_) => 6,
    }
}

/// One sort key: column name plus direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub values: Vec<Scalar>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType, values: Vec<Scalar>) -> Self {
        Self {
            name: name.into(),
            data_type,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn field(&self) -> Field {
        Field::new(
            self.name.clone(),
            self.data_type,
            self.values.iter().any(Scalar::is_null),
        )
    }
}

/// Columnar table. All columns have the same length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<Column>,
}

impl Table {
    /// Build a table, checking that column lengths agree and names are unique.
    pub fn try_new(columns: Vec<Column>) -> Result<Self> {
        let table = Self { columns };
        table.validate()?;
        Ok(table)
    }

    /// Zero-row table with the given schema.
    pub fn empty(schema: &Schema) -> Self {
        Self {
            columns: schema
                .fields
                .iter()
                .map(|f| Column::new(f.name.clone(), f.data_type, Vec::new()))
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.schema().validate()?;
        let rows = self.num_rows();
        if let Some(bad) = self.columns.iter().find(|c| c.len() != rows) {
            return Err(Error::Schema(format!(
                "column '{}' has {} values, expected {}",
                bad.name,
                bad.len(),
                rows
            )));
        }
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn schema(&self) -> Schema {
        Schema::new(self.columns.iter().map(Column::field).collect())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Borrow a column or fail with a schema error.
    pub fn require(&self, name: &str) -> Result<&Column> {
        self.column(name)
            .ok_or_else(|| Error::Schema(format!("column '{}' not found", name)))
    }

    pub fn row(&self, idx: usize) -> TableRow<'_> {
        TableRow {
            table: self,
            row: idx,
        }
    }

    /// Add a column, or replace the existing column with the same name.
    pub fn set_column(&mut self, column: Column) {
        match self.column_index(&column.name) {
            Some(idx) => self.columns[idx] = column,
            None => self.columns.push(column),
        }
    }

    /// New table holding the rows at `indices`, in that order.
    pub fn take(&self, indices: &[usize]) -> Table {
        Table {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data_type: c.data_type,
                    values: indices.iter().map(|&i| c.values[i].clone()).collect(),
                })
                .collect(),
        }
    }

    /// Keep only the first `n` rows.
    pub fn truncate(&mut self, n: usize) {
        for c in &mut self.columns {
            c.values.truncate(n);
        }
    }

    /// Reorder/select columns by name.
    pub fn project(&self, names: &[&str]) -> Result<Table> {
        let columns = names
            .iter()
            .map(|n| self.require(n).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Table { columns })
    }

    /// Row indices in sorted order (stable, so ties keep input order).
    pub fn sorted_indices(&self, keys: &[SortKey]) -> Result<Vec<usize>> {
        let key_cols = keys
            .iter()
            .map(|k| self.require(&k.field).map(|c| (c, k.descending)))
            .collect::<Result<Vec<_>>>()?;

        let mut indices: Vec<usize> = (0..self.num_rows()).collect();
        indices.sort_by(|&a, &b| {
            for (col, descending) in &key_cols {
                let ord = scalar_cmp(&col.values[a], &col.values[b]);
                let ord = if *descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        Ok(indices)
    }

    /// Sort rows in place by the given keys.
    pub fn sort_by_keys(&mut self, keys: &[SortKey]) -> Result<()> {
        let indices = self.sorted_indices(keys)?;
        *self = self.take(&indices);
        Ok(())
    }

    /// Build a table from JSON row objects, inferring the schema.
    ///
    /// Columns appear in first-seen key order. Integers infer `Int64`, other
    /// numbers `Float64`, mixed types fall back to `Utf8`.
    pub fn from_json_rows(rows: &[Value]) -> Result<Table> {
        let mut fields: Vec<(String, Option<DataType>)> = Vec::new();
        for row in rows {
            let obj = row
                .as_object()
                .ok_or_else(|| Error::Schema(format!("inline row is not an object: {}", row)))?;
            for (key, value) in obj {
                let observed = Scalar::from_json(value).data_type();
                match fields.iter_mut().find(|(name, _)| name == key) {
                    Some((_, dt)) => {
                        *dt = match (*dt, observed) {
                            (Some(a), Some(b)) => Some(infer_unify(a, b)),
                            (a, b) => a.or(b),
                        }
                    }
                    None => fields.push((key.clone(), observed)),
                }
            }
        }
        let schema = Schema::new(
            fields
                .into_iter()
                .map(|(name, dt)| Field::new(name, dt.unwrap_or(DataType::Utf8), true))
                .collect(),
        );
        Self::from_json_rows_with_schema(rows, &schema)
    }

    /// Build a table from JSON row objects against a known schema. Missing
    /// keys become nulls; values are coerced to the declared types.
    pub fn from_json_rows_with_schema(rows: &[Value], schema: &Schema) -> Result<Table> {
        let mut table = Table::empty(schema);
        for row in rows {
            let obj = row
                .as_object()
                .ok_or_else(|| Error::Schema(format!("inline row is not an object: {}", row)))?;
            for col in &mut table.columns {
                let value = obj
                    .get(&col.name)
                    .map(Scalar::from_json)
                    .unwrap_or(Scalar::Null);
                col.values.push(value.coerce(col.data_type));
            }
        }
        Ok(table)
    }

    /// Encode rows as JSON objects (column order preserved).
    pub fn to_json_rows(&self) -> Vec<Value> {
        (0..self.num_rows())
            .map(|i| {
                let mut obj = Map::with_capacity(self.columns.len());
                for c in &self.columns {
                    obj.insert(c.name.clone(), c.values[i].to_json());
                }
                Value::Object(obj)
            })
            .collect()
    }
}

/// JSON inference keeps integers and floats together as floats but does not
/// widen booleans into numbers.
fn infer_unify(a: DataType, b: DataType) -> DataType {
    if a == DataType::Boolean || b == DataType::Boolean {
        if a == b {
            DataType::Boolean
        } else {
            DataType::Utf8
        }
    } else {
        a.unify(b)
    }
}

/// Borrowed view of one row of a table.
#[derive(Debug, Clone, Copy)]
pub struct TableRow<'a> {
    table: &'a Table,
    row: usize,
}

impl RowAccess for TableRow<'_> {
    fn get(&self, field: &str) -> Option<&Scalar> {
        self.table.column(field).map(|c| &c.values[self.row])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infers_schema_from_json_rows() {
        let rows = vec![
            json!({"a": 1, "b": "x", "c": true}),
            json!({"a": 2.5, "b": null, "d": 3}),
        ];
        let table = Table::from_json_rows(&rows).unwrap();
        let schema = table.schema();
        assert_eq!(schema.names(), vec!["a", "b", "c", "d"]);
        assert_eq!(schema.fields[0].data_type, DataType::Float64);
        assert_eq!(schema.fields[1].data_type, DataType::Utf8);
        assert_eq!(schema.fields[2].data_type, DataType::Boolean);
        assert_eq!(table.column("d").unwrap().values[0], Scalar::Null);
        assert_eq!(table.column("a").unwrap().values[0], Scalar::F64(1.0));
    }

    #[test]
    fn json_rows_keep_column_order() {
        let table = Table::try_new(vec![
            Column::new("z", DataType::Int64, vec![Scalar::I64(1)]),
            Column::new("a", DataType::Float64, vec![Scalar::F64(f64::NAN)]),
        ])
        .unwrap();
        let rows = table.to_json_rows();
        let first = serde_json::to_string(&rows[0]).unwrap();
        assert_eq!(first, r#"{"z":1,"a":null}"#);
    }

    #[test]
    fn sort_is_stable_and_respects_direction() {
        let mut table = Table::try_new(vec![
            Column::new(
                "k",
                DataType::Utf8,
                vec![
                    Scalar::Str("b".into()),
                    Scalar::Str("a".into()),
                    Scalar::Str("b".into()),
                ],
            ),
            Column::new(
                "v",
                DataType::Int64,
                vec![Scalar::I64(1), Scalar::I64(2), Scalar::I64(3)],
            ),
        ])
        .unwrap();
        table.sort_by_keys(&[SortKey::desc("k")]).unwrap();
        let v: Vec<_> = table.column("v").unwrap().values.clone();
        assert_eq!(v, vec![Scalar::I64(1), Scalar::I64(3), Scalar::I64(2)]);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = Table::try_new(vec![
            Column::new("a", DataType::Int64, vec![Scalar::I64(1)]),
            Column::new("b", DataType::Int64, vec![]),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn coerce_handles_temporal_strings() {
        let ts = Scalar::Str("2020-01-02".into()).coerce(DataType::Timestamp);
        assert_eq!(ts, Scalar::Timestamp(1_577_923_200_000));
        let d = ts.coerce(DataType::Date32);
        assert_eq!(d, Scalar::Date32(18263));
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(
            scalar_cmp(&Scalar::I64(2), &Scalar::F64(2.5)),
            Ordering::Less
        );
        assert_eq!(scalar_cmp(&Scalar::Null, &Scalar::I64(0)), Ordering::Less);
        assert_eq!(
            scalar_cmp(&Scalar::F64(f64::NAN), &Scalar::F64(1e300)),
            Ordering::Greater
        );
    }
}
