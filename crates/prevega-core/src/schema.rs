//! Logical schema types. Pure data; Arrow conversion lives behind the `arrow` feature.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Utf8,
    /// Days since the Unix epoch.
    Date32,
    /// Milliseconds since the Unix epoch (UTC).
    Timestamp,
}

impl DataType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        )
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, DataType::Float32 | DataType::Float64)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date32 | DataType::Timestamp)
    }

    /// Common type for values coming from columns of type `self` and `other`
    /// (used by `fold`, which stacks several columns into one).
    pub fn unify(self, other: DataType) -> DataType {
        if self == other {
            self
        } else if self.is_integer() && other.is_integer() {
            DataType::Int64
        } else if self.is_numeric() && other.is_numeric() {
            DataType::Float64
        } else if self.is_temporal() && other.is_temporal() {
            DataType::Timestamp
        } else {
            DataType::Utf8
        }
    }

    /// Parse the type names accepted in configuration files and binding
    /// declarations (Arrow-style and short aliases).
    pub fn parse(s: &str) -> Option<DataType> {
        Some(match s.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => DataType::Boolean,
            "int8" | "i8" => DataType::Int8,
            "int16" | "i16" => DataType::Int16,
            "int32" | "i32" => DataType::Int32,
            "int64" | "i64" | "integer" => DataType::Int64,
            "float32" | "f32" => DataType::Float32,
            "float64" | "f64" | "number" => DataType::Float64,
            "utf8" | "string" | "str" => DataType::Utf8,
            "date32" | "date" => DataType::Date32,
            "timestamp" | "datetime" => DataType::Timestamp,
            _ => return None,
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Boolean => "Boolean",
            DataType::Int8 => "Int8",
            DataType::Int16 => "Int16",
            DataType::Int32 => "Int32",
            DataType::Int64 => "Int64",
            DataType::Float32 => "Float32",
            DataType::Float64 => "Float64",
            DataType::Utf8 => "Utf8",
            DataType::Date32 => "Date32",
            DataType::Timestamp => "Timestamp",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Build a schema and reject duplicate column names.
    pub fn try_new(fields: Vec<Field>) -> Result<Self> {
        let schema = Self { fields };
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.fields.len());
        for f in &self.fields {
            if !seen.insert(f.name.as_str()) {
                return Err(Error::Schema(format!("duplicate column name '{}'", f.name)));
            }
        }
        Ok(())
    }

    pub fn field(&self, idx: usize) -> Option<&Field> {
        self.fields.get(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Look up a column, failing with a schema error naming the column.
    pub fn require(&self, name: &str) -> Result<&Field> {
        self.field_by_name(name)
            .ok_or_else(|| Error::Schema(format!("column '{}' not found", name)))
    }

    /// Return a copy with `field` appended, or replacing an existing column of
    /// the same name in place.
    pub fn with_field(&self, field: Field) -> Schema {
        let mut out = self.clone();
        match out.index_of(&field.name) {
            Some(idx) => out.fields[idx] = field,
            None => out.fields.push(field),
        }
        out
    }

    /// True when both schemas have the same column names, ignoring order.
    pub fn same_names(&self, other: &Schema) -> bool {
        if self.fields.len() != other.fields.len() {
            return false;
        }
        self.fields.iter().all(|f| other.contains(&f.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Schema::try_new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("a", DataType::Utf8, true),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn with_field_overwrites_in_place() {
        let schema = Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Utf8, true),
        ]);
        let out = schema.with_field(Field::new("a", DataType::Float64, true));
        assert_eq!(out.names(), vec!["a", "b"]);
        assert_eq!(out.fields[0].data_type, DataType::Float64);
    }

    #[test]
    fn unify_widens() {
        assert_eq!(DataType::Int8.unify(DataType::Int32), DataType::Int64);
        assert_eq!(DataType::Int64.unify(DataType::Float32), DataType::Float64);
        assert_eq!(DataType::Utf8.unify(DataType::Int64), DataType::Utf8);
    }
}
