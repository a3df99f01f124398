//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use prevega_core::config::PreTransformConfig;
use prevega_core::registry::{ExternalHandle, Payload, SchemaRegistry};
use prevega_core::schema::DataType;
use prevega_core::types::{Column, Scalar, Table};
use prevega_core::warning::{Warning, WarningKind};
use prevega_exec::PreTransformRuntime;
use prevega_planner::Specification;
use serde_json::Value;

/// `id` 0..rows, `category` alternating "a"/"b", `value` = id as float.
pub fn numbers(rows: usize) -> Table {
    Table::try_new(vec![
        Column::new(
            "id",
            DataType::Int64,
            (0..rows as i64).map(Scalar::I64).collect(),
        ),
        Column::new(
            "category",
            DataType::Utf8,
            (0..rows)
                .map(|i| Scalar::Str(if i % 2 == 0 { "a" } else { "b" }.to_string()))
                .collect(),
        ),
        Column::new(
            "value",
            DataType::Float64,
            (0..rows).map(|i| Scalar::F64(i as f64)).collect(),
        ),
    ])
    .expect("valid fixture table")
}

/// Registry with each `(name, table)` bound inline.
pub fn registry(tables: &[(&str, Table)]) -> Arc<SchemaRegistry> {
    let reg = SchemaRegistry::new();
    for (name, table) in tables {
        reg.bind_table(*name, table.clone()).expect("bind fixture");
    }
    Arc::new(reg)
}

/// Registry with `name` bound to an external handle.
pub fn external_registry(name: &str, handle: &str, table: &Table) -> Arc<SchemaRegistry> {
    let reg = SchemaRegistry::new();
    reg.bind(
        name,
        table.schema(),
        Payload::External(ExternalHandle::new(handle)),
    )
    .expect("bind fixture");
    Arc::new(reg)
}

pub fn spec(value: Value) -> Specification {
    Specification::new(value).expect("fixture spec is an object")
}

pub fn runtime() -> PreTransformRuntime {
    PreTransformRuntime::new(PreTransformConfig::default())
}

pub fn entry<'a>(spec: &'a Specification, name: &str) -> &'a Value {
    spec.data()
        .iter()
        .find(|e| e["name"] == name)
        .unwrap_or_else(|| panic!("no data entry '{}'", name))
}

/// Number of inlined rows on the data entry `name`.
pub fn value_count(spec: &Specification, name: &str) -> usize {
    entry(spec, name)["values"].as_array().map_or(0, Vec::len)
}

pub fn warnings_of<'a>(warnings: &'a [Warning], kind: WarningKind) -> Vec<&'a Warning> {
    warnings.iter().filter(|w| w.kind == kind).collect()
}
