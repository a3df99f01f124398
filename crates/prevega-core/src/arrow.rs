//! Conversion between `Table` and Arrow `RecordBatch`.

use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, RecordBatch, StringArray, TimestampMillisecondArray,
};
use arrow_schema::{DataType as ArrowType, Field as ArrowField, Schema as ArrowSchema, TimeUnit};

use crate::error::{Error, Result};
use crate::schema::{DataType, Field, Schema};
use crate::types::{Column, Scalar, Table};

pub fn to_arrow_type(dt: DataType) -> ArrowType {
    match dt {
        DataType::Boolean => ArrowType::Boolean,
        DataType::Int8 => ArrowType::Int8,
        DataType::Int16 => ArrowType::Int16,
        DataType::Int32 => ArrowType::Int32,
        DataType::Int64 => ArrowType::Int64,
        DataType::Float32 => ArrowType::Float32,
        DataType::Float64 => ArrowType::Float64,
        DataType::Utf8 => ArrowType::Utf8,
        DataType::Date32 => ArrowType::Date32,
        DataType::Timestamp => ArrowType::Timestamp(TimeUnit::Millisecond, None),
    }
}

pub fn from_arrow_type(dt: &ArrowType) -> Result<DataType> {
    Ok(match dt {
        ArrowType::Boolean => DataType::Boolean,
        ArrowType::Int8 => DataType::Int8,
        ArrowType::Int16 => DataType::Int16,
        ArrowType::Int32 => DataType::Int32,
        ArrowType::Int64 => DataType::Int64,
        ArrowType::Float32 => DataType::Float32,
        ArrowType::Float64 => DataType::Float64,
        ArrowType::Utf8 | ArrowType::LargeUtf8 => DataType::Utf8,
        ArrowType::Date32 => DataType::Date32,
        ArrowType::Timestamp(TimeUnit::Millisecond, _) => DataType::Timestamp,
        other => return Err(Error::Schema(format!("unsupported Arrow type {}", other))),
    })
}

pub fn to_arrow_schema(schema: &Schema) -> ArrowSchema {
    ArrowSchema::new(
        schema
            .fields
            .iter()
            .map(|f| ArrowField::new(f.name.clone(), to_arrow_type(f.data_type), f.nullable))
            .collect::<Vec<_>>(),
    )
}

pub fn from_arrow_schema(schema: &ArrowSchema) -> Result<Schema> {
    let fields = schema
        .fields()
        .iter()
        .map(|f| {
            Ok(Field::new(
                f.name().clone(),
                from_arrow_type(f.data_type())?,
                f.is_nullable(),
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Schema::try_new(fields)
}

fn column_to_array(col: &Column) -> ArrayRef {
    let ints = || col.values.iter().map(|v| match v {
        Scalar::I64(i) => Some(*i),
        _ => None,
    });
    let floats = || col.values.iter().map(|v| match v {
        Scalar::F64(f) => Some(*f),
        _ => None,
    });
    match col.data_type {
        DataType::Boolean => Arc::new(
            col.values
                .iter()
                .map(|v| match v {
                    Scalar::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
        DataType::Int8 => Arc::new(ints().map(|v| v.map(|i| i as i8)).collect::<Int8Array>()),
        DataType::Int16 => Arc::new(ints().map(|v| v.map(|i| i as i16)).collect::<Int16Array>()),
        DataType::Int32 => Arc::new(ints().map(|v| v.map(|i| i as i32)).collect::<Int32Array>()),
        DataType::Int64 => Arc::new(ints().collect::<Int64Array>()),
        DataType::Float32 => Arc::new(
            floats()
                .map(|v| v.map(|f| f as f32))
                .collect::<Float32Array>(),
        ),
        DataType::Float64 => Arc::new(floats().collect::<Float64Array>()),
        DataType::Utf8 => Arc::new(
            col.values
                .iter()
                .map(|v| match v {
                    Scalar::Str(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<StringArray>(),
        ),
        DataType::Date32 => Arc::new(
            col.values
                .iter()
                .map(|v| match v {
                    Scalar::Date32(d) => Some(*d),
                    _ => None,
                })
                .collect::<Date32Array>(),
        ),
        DataType::Timestamp => Arc::new(
            col.values
                .iter()
                .map(|v| match v {
                    Scalar::Timestamp(ms) => Some(*ms),
                    _ => None,
                })
                .collect::<TimestampMillisecondArray>(),
        ),
    }
}

pub fn table_to_record_batch(table: &Table) -> Result<RecordBatch> {
    let schema = Arc::new(to_arrow_schema(&table.schema()));
    let arrays = table.columns.iter().map(column_to_array).collect::<Vec<_>>();
    RecordBatch::try_new(schema, arrays).map_err(|e| Error::Schema(e.to_string()))
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, name: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Schema(format!("column '{}' has an unexpected array type", name)))
}

fn array_values(array: &ArrayRef, dt: DataType, name: &str) -> Result<Vec<Scalar>> {
    macro_rules! collect {
        ($ty:ty, $conv:expr) => {{
            let a = downcast::<$ty>(array, name)?;
            (0..a.len())
                .map(|i| if a.is_null(i) { Scalar::Null } else { $conv(a.value(i)) })
                .collect()
        }};
    }
    Ok(match dt {
        DataType::Boolean => collect!(BooleanArray, Scalar::Bool),
        DataType::Int8 => collect!(Int8Array, |v: i8| Scalar::I64(v as i64)),
        DataType::Int16 => collect!(Int16Array, |v: i16| Scalar::I64(v as i64)),
        DataType::Int32 => collect!(Int32Array, |v: i32| Scalar::I64(v as i64)),
        DataType::Int64 => collect!(Int64Array, Scalar::I64),
        DataType::Float32 => collect!(Float32Array, |v: f32| Scalar::F64(v as f64)),
        DataType::Float64 => collect!(Float64Array, Scalar::F64),
        DataType::Utf8 => collect!(StringArray, |v: &str| Scalar::Str(v.to_string())),
        DataType::Date32 => collect!(Date32Array, Scalar::Date32),
        DataType::Timestamp => collect!(TimestampMillisecondArray, Scalar::Timestamp),
    })
}

pub fn record_batch_to_table(batch: &RecordBatch) -> Result<Table> {
    let schema = from_arrow_schema(&batch.schema())?;
    let columns = schema
        .fields
        .iter()
        .zip(batch.columns())
        .map(|(f, array)| {
            Ok(Column::new(
                f.name.clone(),
                f.data_type,
                array_values(array, f.data_type, &f.name)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Table::try_new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_survives_record_batch() {
        let table = Table::try_new(vec![
            Column::new("n", DataType::Int32, vec![Scalar::I64(1), Scalar::Null]),
            Column::new(
                "s",
                DataType::Utf8,
                vec![Scalar::Str("a".into()), Scalar::Str("b".into())],
            ),
            Column::new(
                "t",
                DataType::Timestamp,
                vec![Scalar::Timestamp(0), Scalar::Timestamp(86_400_000)],
            ),
        ])
        .unwrap();
        let batch = table_to_record_batch(&table).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let back = record_batch_to_table(&batch).unwrap();
        assert_eq!(back, table);
    }
}
