//! Per-request dataset bindings.
//!
//! The registry maps a dataset name to its declared schema and a payload:
//! either an inline table or an opaque handle that only an executor knows how
//! to read. Bindings are immutable once made.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::types::Table;

/// Reference to data that lives with an executor (a warehouse table, a
/// Spark view, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalHandle {
    /// Table name as the executor knows it.
    pub table: String,
    /// Executor-specific properties, passed through untouched.
    #[serde(default)]
    pub properties: Value,
}

impl ExternalHandle {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            properties: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Inline(Table),
    External(ExternalHandle),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetBinding {
    pub name: String,
    pub schema: Schema,
    pub payload: Payload,
}

impl DatasetBinding {
    pub fn is_inline(&self) -> bool {
        matches!(self.payload, Payload::Inline(_))
    }
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    bindings: RwLock<HashMap<String, Arc<DatasetBinding>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`. Fails if the schema has duplicate columns, an inline
    /// table's columns differ from the schema, or the name is already bound.
    pub fn bind(
        &self,
        name: impl Into<String>,
        schema: Schema,
        payload: Payload,
    ) -> Result<Arc<DatasetBinding>> {
        let name = name.into();
        schema.validate()?;
        if let Payload::Inline(table) = &payload {
            table.validate()?;
            if !table.schema().same_names(&schema) {
                return Err(Error::Schema(format!(
                    "inline table for '{}' has columns {:?}, schema declares {:?}",
                    name,
                    table.schema().names(),
                    schema.names()
                )));
            }
        }

        let binding = Arc::new(DatasetBinding {
            name: name.clone(),
            schema,
            payload,
        });
        let mut guard = self
            .bindings
            .write()
            .map_err(|_| Error::Invariant("registry lock poisoned".into()))?;
        if guard.contains_key(&name) {
            return Err(Error::Schema(format!("dataset '{}' is already bound", name)));
        }
        guard.insert(name, binding.clone());
        Ok(binding)
    }

    /// Bind an inline table under its own schema.
    pub fn bind_table(&self, name: impl Into<String>, table: Table) -> Result<Arc<DatasetBinding>> {
        let schema = table.schema();
        self.bind(name, schema, Payload::Inline(table))
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<DatasetBinding>> {
        let guard = self
            .bindings
            .read()
            .map_err(|_| Error::Invariant("registry lock poisoned".into()))?;
        guard
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Bound names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.bindings.read() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Field};
    use crate::types::{Column, Scalar};

    #[test]
    fn bind_and_resolve() {
        let reg = SchemaRegistry::new();
        let schema = Schema::new(vec![Field::new("a", DataType::Int64, false)]);
        let payload = Payload::External(ExternalHandle::new("db.t"));
        reg.bind("ext", schema.clone(), payload).unwrap();
        let b = reg.resolve("ext").unwrap();
        assert_eq!(b.schema, schema);
        assert!(!b.is_inline());
        assert!(matches!(reg.resolve("missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn rebinding_is_rejected() {
        let reg = SchemaRegistry::new();
        let first = Payload::External(ExternalHandle::new("x"));
        reg.bind("x", Schema::default(), first).unwrap();
        let second = Payload::External(ExternalHandle::new("y"));
        assert!(reg.bind("x", Schema::default(), second).is_err());
        assert_eq!(reg.names(), vec!["x"]);
    }

    #[test]
    fn inline_columns_must_match_schema() {
        let reg = SchemaRegistry::new();
        let table = Table::try_new(vec![Column::new(
            "a",
            DataType::Int64,
            vec![Scalar::I64(1)],
        )])
        .unwrap();
        let schema = Schema::new(vec![Field::new("b", DataType::Int64, false)]);
        let err = reg.bind("t", schema, Payload::Inline(table)).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
