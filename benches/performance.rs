use std::collections::HashMap;

use criterion::{criterion_group, criterion_main, Criterion};
use prevega_core::config::PreTransformConfig;
use prevega_core::dag::LogicalPlan;
use prevega_core::registry::SchemaRegistry;
use prevega_core::schema::DataType;
use prevega_core::types::{Column, Scalar, Table};
use prevega_exec::PreTransformRuntime;
use prevega_operators::{execute, EvalContext};
use prevega_planner::{Capabilities, PlanBuilder, SignalScope, Specification, TransformSpec};
use serde_json::json;

fn make_table(rows: usize) -> Table {
    Table::try_new(vec![
        Column::new(
            "group",
            DataType::Utf8,
            (0..rows).map(|i| Scalar::Str(format!("group-{}", i % 4))).collect(),
        ),
        Column::new(
            "order",
            DataType::Int64,
            (0..rows as i64).map(Scalar::I64).collect(),
        ),
        Column::new(
            "value",
            DataType::Float64,
            (0..rows).map(|i| Scalar::F64((i % 10) as f64)).collect(),
        ),
    ])
    .unwrap()
}

fn plan_for(table: &Table, transforms: serde_json::Value) -> LogicalPlan {
    let transforms: Vec<TransformSpec> = transforms
        .as_array()
        .unwrap()
        .iter()
        .map(TransformSpec::parse)
        .collect();
    let caps = Capabilities::all();
    let signals = SignalScope::new();
    let built = PlanBuilder::new(&caps, &signals)
        .build(&transforms, LogicalPlan::scan("rows", table.schema()));
    assert!(built.is_complete());
    built.plan
}

fn bench_operators(c: &mut Criterion) {
    let table = make_table(4096);
    let scans = HashMap::from([("rows".to_string(), table.clone())]);

    let window = plan_for(
        &table,
        json!([{
            "type": "window",
            "groupby": ["group"],
            "sort": {"field": "order"},
            "ops": ["row_number", "sum"],
            "fields": [null, "value"],
            "as": ["row_num", "sum_value"]
        }]),
    );
    c.bench_function("window_op", |b| {
        b.iter(|| execute(&window, &scans, &mut EvalContext::new()).unwrap())
    });

    let aggregate = plan_for(
        &table,
        json!([
            {"type": "filter", "expr": "datum.value > 2"},
            {"type": "aggregate", "groupby": ["group"], "ops": ["count", "mean"], "fields": [null, "value"]}
        ]),
    );
    c.bench_function("filter_aggregate", |b| {
        b.iter(|| execute(&aggregate, &scans, &mut EvalContext::new()).unwrap())
    });
}

fn bench_pre_transform(c: &mut Criterion) {
    let registry = SchemaRegistry::new();
    registry.bind_table("rows", make_table(4096)).unwrap();
    let registry = std::sync::Arc::new(registry);
    let spec = Specification::new(json!({
        "data": [
            {
                "name": "binned",
                "url": "table://rows",
                "transform": [
                    {"type": "extent", "field": "value", "signal": "value_extent"},
                    {"type": "bin", "field": "value", "extent": {"signal": "value_extent"}, "maxbins": 5},
                    {"type": "aggregate", "groupby": ["bin0", "bin1"]}
                ]
            },
            {
                "name": "ranked",
                "url": "table://rows",
                "transform": [
                    {"type": "window", "groupby": ["group"], "sort": {"field": "value", "order": "descending"}, "ops": ["rank"]},
                    {"type": "filter", "expr": "datum.rank <= 3"}
                ]
            }
        ]
    }))
    .unwrap();
    let runtime = PreTransformRuntime::new(PreTransformConfig::default());
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("pre_transform", |b| {
        b.iter(|| rt.block_on(runtime.pre_transform(&spec, registry.clone())).unwrap())
    });
}

criterion_group!(benches, bench_operators, bench_pre_transform);
criterion_main!(benches);
