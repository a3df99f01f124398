//! End-to-end pre-transform behavior through the embedded engine.

mod common;

use common::{entry, numbers, registry, runtime, spec, value_count, warnings_of};
use prevega_core::config::{OutputMode, PreTransformConfig};
use prevega_core::error::Error;
use prevega_core::registry::SchemaRegistry;
use prevega_core::warning::WarningKind;
use prevega_exec::{ExecError, PreTransformRuntime};
use prevega_planner::SourceGraph;
use serde_json::{json, Value};
use std::sync::Arc;

#[test]
fn extraction_yields_one_node_per_data_source() {
    let s = spec(json!({
        "data": [
            {"name": "a", "url": "table://a"},
            {"name": "b", "source": "a", "transform": [{"type": "filter", "expr": "true"}]},
            {"name": "c", "source": "b"},
            {"name": "d", "values": [{"x": 1}]},
            {"name": "e", "url": "data/cars.json"}
        ]
    }));
    let graph = SourceGraph::extract(&s).unwrap();
    assert_eq!(graph.len(), 5);
}

#[tokio::test]
async fn supported_pipelines_are_fully_inlined() {
    let s = spec(json!({
        "data": [{
            "name": "summary",
            "url": "table://numbers",
            "transform": [
                {"type": "filter", "expr": "datum.value > 2"},
                {"type": "formula", "expr": "datum.value * 2", "as": "double"},
                {"type": "aggregate", "groupby": ["category"], "ops": ["count", "sum"], "fields": [null, "double"]},
                {"type": "collect", "sort": {"field": "category"}}
            ]
        }]
    }));
    let out = runtime()
        .pre_transform(&s, registry(&[("numbers", numbers(10))]))
        .await
        .unwrap();

    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
    let summary = entry(&out.spec, "summary");
    assert!(summary.get("transform").is_none());
    assert!(summary.get("url").is_none());
    assert_eq!(
        summary["values"],
        json!([
            {"category": "a", "count": 3, "sum_double": 36.0},
            {"category": "b", "count": 4, "sum_double": 48.0}
        ])
    );
    assert_eq!(out.results.len(), 1);
    assert!(!out.results[0].partial);
    assert_eq!(out.results[0].folded, 4);
}

#[tokio::test]
async fn unsupported_transform_keeps_the_tail() {
    let transforms = json!([
        {"type": "filter", "expr": "datum.value >= 5"},
        {"type": "formula", "expr": "datum.value + 1", "as": "next"},
        {"type": "pie", "field": "next"},
        {"type": "filter", "expr": "datum.next > 7"}
    ]);
    let s = spec(json!({
        "data": [{"name": "tail", "url": "table://numbers", "transform": transforms}]
    }));
    let out = runtime()
        .pre_transform(&s, registry(&[("numbers", numbers(10))]))
        .await
        .unwrap();

    let tail = entry(&out.spec, "tail");
    assert_eq!(
        tail["transform"],
        Value::Array(transforms.as_array().unwrap()[2..].to_vec())
    );
    assert_eq!(tail["values"].as_array().unwrap().len(), 5);
    assert_eq!(out.warnings.len(), 1);
    assert_eq!(out.warnings[0].kind, WarningKind::UnsupportedTransform);
    assert_eq!(out.warnings[0].dataset_name, "tail");
    assert!(out.results[0].partial);
    assert_eq!(out.results[0].folded, 2);
}

#[tokio::test]
async fn pre_evaluated_specs_are_left_alone() {
    let s = spec(json!({
        "data": [{
            "name": "binned",
            "url": "table://numbers",
            "transform": [
                {"type": "extent", "field": "value", "signal": "value_extent"},
                {"type": "bin", "field": "value", "extent": {"signal": "value_extent"}, "maxbins": 5}
            ]
        }],
        "marks": [{"type": "rect", "from": {"data": "binned"}}]
    }));
    let first = runtime()
        .pre_transform(&s, registry(&[("numbers", numbers(10))]))
        .await
        .unwrap();
    assert!(first.warnings.is_empty());

    let second = runtime()
        .pre_transform(&first.spec, Arc::new(SchemaRegistry::new()))
        .await
        .unwrap();
    assert_eq!(second.spec, first.spec);
    assert!(second.warnings.is_empty());
    assert!(second.results.is_empty());
}

#[tokio::test]
async fn extent_then_bin_over_ten_rows() {
    let s = spec(json!({
        "data": [{
            "name": "binned",
            "url": "vegafusion+dataset://numbers",
            "transform": [
                {"type": "extent", "field": "value", "signal": "value_extent"},
                {"type": "bin", "field": "value", "extent": {"signal": "value_extent"}, "maxbins": 10}
            ]
        }]
    }));
    let out = runtime()
        .pre_transform(&s, registry(&[("numbers", numbers(10))]))
        .await
        .unwrap();

    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
    let binned = entry(&out.spec, "binned");
    assert!(binned.get("transform").is_none());
    let rows = binned["values"].as_array().unwrap();
    assert_eq!(rows.len(), 10);
    for row in rows {
        let b0 = row["bin0"].as_f64().unwrap();
        let b1 = row["bin1"].as_f64().unwrap();
        let v = row["value"].as_f64().unwrap();
        assert!(b0 <= v && v <= b1, "{} not in [{}, {}]", v, b0, b1);
    }
    assert_eq!(
        out.spec.as_value()["signals"],
        json!([{"name": "value_extent", "value": [0.0, 9.0]}])
    );
}

#[tokio::test]
async fn empty_datasets_evaluate_beside_their_siblings() {
    let s = spec(json!({
        "data": [
            {"name": "ok", "url": "table://numbers", "transform": [{"type": "filter", "expr": "datum.value > 2"}]},
            {
                "name": "binned",
                "url": "table://empty",
                "transform": [
                    {"type": "extent", "field": "value", "signal": "e"},
                    {"type": "bin", "field": "value", "extent": {"signal": "e"}, "signal": "bins"}
                ]
            },
            {"name": "counted", "url": "table://empty", "transform": [{"type": "aggregate", "ops": ["count"]}]}
        ]
    }));
    let out = runtime()
        .pre_transform(
            &s,
            registry(&[("numbers", numbers(5)), ("empty", numbers(0))]),
        )
        .await
        .unwrap();

    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
    assert_eq!(value_count(&out.spec, "ok"), 2);
    assert_eq!(entry(&out.spec, "binned")["values"], json!([]));
    assert_eq!(entry(&out.spec, "counted")["values"], json!([{"count": 0}]));
    let signals = out.spec.as_value()["signals"].as_array().unwrap().clone();
    assert_eq!(signals, vec![json!({"name": "e", "value": [null, null]})]);
}

#[tokio::test]
async fn bin_base_that_cannot_grow_returns_promptly() {
    let s = spec(json!({
        "data": [{
            "name": "binned",
            "url": "table://numbers",
            "transform": [
                {"type": "filter", "expr": "datum.value > 0"},
                {"type": "bin", "field": "value", "extent": [0, 100], "base": 1}
            ]
        }]
    }));
    let out = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        runtime().pre_transform(&s, registry(&[("numbers", numbers(10))])),
    )
    .await
    .expect("pre_transform finished")
    .unwrap();

    assert_eq!(out.warnings.len(), 1);
    assert_eq!(out.warnings[0].kind, WarningKind::UnsupportedTransform);
    let binned = entry(&out.spec, "binned");
    assert_eq!(binned["values"].as_array().unwrap().len(), 9);
    assert_eq!(binned["transform"], json!([s.data()[0]["transform"][1]]));
}

#[tokio::test]
async fn partial_merge_after_aggregate() {
    let s = spec(json!({
        "data": [{
            "name": "counts",
            "url": "table://numbers",
            "transform": [
                {"type": "filter", "expr": "datum.id < 6"},
                {"type": "aggregate", "groupby": ["category"]},
                {"type": "pie", "field": "count"}
            ]
        }]
    }));
    let out = runtime()
        .pre_transform(&s, registry(&[("numbers", numbers(10))]))
        .await
        .unwrap();

    let counts = entry(&out.spec, "counts");
    assert_eq!(
        counts["transform"],
        json!([{"type": "pie", "field": "count"}])
    );
    assert_eq!(
        counts["values"],
        json!([{"category": "a", "count": 3}, {"category": "b", "count": 3}])
    );
    assert_eq!(out.warnings.len(), 1);
    assert_eq!(out.warnings[0].kind, WarningKind::UnsupportedTransform);
    assert_eq!(out.warnings[0].dataset_name, "counts");
}

#[tokio::test]
async fn unbound_datasets_drop_their_subtree() {
    let s = spec(json!({
        "data": [
            {"name": "missing", "url": "table://nowhere", "transform": [{"type": "filter", "expr": "true"}]},
            {"name": "child", "source": "missing", "transform": [{"type": "filter", "expr": "true"}]},
            {"name": "fine", "values": [{"x": 1}, {"x": 2}], "transform": [{"type": "filter", "expr": "datum.x > 1"}]}
        ]
    }));
    let out = runtime()
        .pre_transform(&s, Arc::new(SchemaRegistry::new()))
        .await
        .unwrap();

    assert_eq!(entry(&out.spec, "missing"), &s.data()[0]);
    assert_eq!(entry(&out.spec, "child"), &s.data()[1]);
    assert_eq!(entry(&out.spec, "fine")["values"], json!([{"x": 2}]));

    let mismatch = warnings_of(&out.warnings, WarningKind::SchemaMismatch);
    assert_eq!(mismatch.len(), 1);
    assert_eq!(mismatch[0].dataset_name, "missing");
    let partial = warnings_of(&out.warnings, WarningKind::PartialEvaluation);
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0].dataset_name, "child");
}

#[tokio::test]
async fn children_read_their_parents_rows() {
    let s = spec(json!({
        "data": [
            {"name": "raw", "values": [{"k": "x", "v": 1}, {"k": "y", "v": 2}, {"k": "x", "v": 3}]},
            {"name": "alias", "source": "raw"},
            {"name": "sums", "source": "alias", "transform": [
                {"type": "aggregate", "groupby": ["k"], "ops": ["sum"], "fields": ["v"], "as": ["total"]}
            ]},
            {"name": "top", "source": "sums", "transform": [{"type": "filter", "expr": "datum.total > 3"}]}
        ]
    }));
    let out = runtime()
        .pre_transform(&s, Arc::new(SchemaRegistry::new()))
        .await
        .unwrap();

    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
    assert_eq!(entry(&out.spec, "raw"), &s.data()[0]);
    assert_eq!(entry(&out.spec, "alias"), &s.data()[1]);
    assert_eq!(
        entry(&out.spec, "sums")["values"],
        json!([{"k": "x", "total": 4.0}, {"k": "y", "total": 2.0}])
    );
    assert_eq!(
        entry(&out.spec, "top")["values"],
        json!([{"k": "x", "total": 4.0}])
    );
    let names: Vec<_> = out
        .results
        .iter()
        .map(|r| r.dataset_name.as_str())
        .collect();
    assert_eq!(names, vec!["sums", "top"]);
}

#[tokio::test]
async fn client_only_upstreams_warn_when_they_carry_transforms() {
    let s = spec(json!({
        "data": [
            {"name": "remote", "url": "data/cars.json", "transform": [{"type": "filter", "expr": "true"}]},
            {"name": "plain", "url": "data/cars.json"}
        ]
    }));
    let out = runtime()
        .pre_transform(&s, Arc::new(SchemaRegistry::new()))
        .await
        .unwrap();
    assert_eq!(out.spec, s);
    assert_eq!(out.warnings.len(), 1);
    assert_eq!(out.warnings[0].kind, WarningKind::PartialEvaluation);
    assert_eq!(out.warnings[0].dataset_name, "remote");
}

#[tokio::test]
async fn external_rows_materialize_even_without_folding() {
    let s = spec(json!({
        "data": [{"name": "pies", "url": "table://numbers", "transform": [{"type": "pie", "field": "value"}]}]
    }));
    let out = runtime()
        .pre_transform(&s, registry(&[("numbers", numbers(4))]))
        .await
        .unwrap();
    let pies = entry(&out.spec, "pies");
    assert_eq!(pies["values"].as_array().unwrap().len(), 4);
    assert_eq!(
        pies["transform"],
        json!([{"type": "pie", "field": "value"}])
    );
    assert_eq!(out.results[0].folded, 0);
}

#[tokio::test]
async fn interactive_signals_stay_client_side_unless_released() {
    let s = spec(json!({
        "signals": [{"name": "threshold", "value": 6, "bind": {"input": "range"}}],
        "data": [{
            "name": "above",
            "url": "table://numbers",
            "transform": [
                {"type": "formula", "expr": "datum.value * 10", "as": "scaled"},
                {"type": "filter", "expr": "datum.value > threshold"}
            ]
        }]
    }));

    let kept = runtime()
        .pre_transform(&s, registry(&[("numbers", numbers(10))]))
        .await
        .unwrap();
    let above = entry(&kept.spec, "above");
    assert_eq!(above["transform"].as_array().unwrap().len(), 1);
    assert_eq!(above["values"].as_array().unwrap().len(), 10);
    assert_eq!(kept.warnings.len(), 1);
    assert!(kept.warnings[0].message.contains("threshold"));

    let released = PreTransformRuntime::new(PreTransformConfig {
        preserve_client_interactivity: false,
        ..PreTransformConfig::default()
    })
    .pre_transform(&s, registry(&[("numbers", numbers(10))]))
    .await
    .unwrap();
    let above = entry(&released.spec, "above");
    assert!(above.get("transform").is_none());
    assert_eq!(above["values"].as_array().unwrap().len(), 3);
    assert!(released.warnings.is_empty());
}

#[tokio::test]
async fn row_limit_truncates_with_a_warning() {
    let s = spec(json!({
        "data": [{"name": "many", "url": "table://numbers", "transform": [{"type": "filter", "expr": "datum.id >= 2"}]}]
    }));
    let out = PreTransformRuntime::new(PreTransformConfig {
        row_limit: Some(3),
        ..PreTransformConfig::default()
    })
    .pre_transform(&s, registry(&[("numbers", numbers(10))]))
    .await
    .unwrap();
    assert_eq!(value_count(&out.spec, "many"), 3);
    assert_eq!(out.warnings.len(), 1);
    assert_eq!(out.warnings[0].kind, WarningKind::RowLimitExceeded);
    assert_eq!(out.metadata()[0].row_count, Some(3));
}

#[tokio::test]
async fn structural_errors_fail_before_execution() {
    let s = spec(json!({
        "data": [
            {"name": "a", "source": "b"},
            {"name": "b", "source": "a"}
        ]
    }));
    let err = runtime()
        .pre_transform(&s, Arc::new(SchemaRegistry::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Spec(Error::MalformedSpec(_))));

    let bad_config = PreTransformRuntime::new(PreTransformConfig {
        local_timezone: "Nowhere/Special".into(),
        ..PreTransformConfig::default()
    });
    let err = bad_config
        .pre_transform(&spec(json!({})), Arc::new(SchemaRegistry::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Spec(Error::Config(_))));
}

#[tokio::test]
async fn vendor_mode_writes_query_references() {
    let s = spec(json!({
        "data": [
            {"name": "filtered", "url": "table://numbers", "transform": [{"type": "filter", "expr": "datum.value > 4"}]},
            {"name": "counts", "source": "filtered", "transform": [{"type": "aggregate", "groupby": ["category"]}]}
        ]
    }));
    let vendor = PreTransformRuntime::new(PreTransformConfig {
        output_mode: OutputMode::VendorReference,
        ..PreTransformConfig::default()
    });
    let out = vendor
        .pre_transform(&s, registry(&[("numbers", numbers(10))]))
        .await
        .unwrap();

    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
    let filtered = entry(&out.spec, "filtered");
    let url = filtered["url"].as_str().unwrap();
    assert!(url.starts_with("prevega+query://"));
    assert!(filtered["query"].as_str().unwrap().contains("WHERE"));
    assert!(filtered.get("values").is_none());

    let counts = entry(&out.spec, "counts");
    assert!(counts.get("source").is_none());
    let query = counts["query"].as_str().unwrap();
    assert!(query.contains("GROUP BY"));
    assert!(query.contains("WHERE"));
    assert!(out.metadata().iter().all(|m| m.row_count.is_none()));

    let again = vendor
        .pre_transform(&out.spec, Arc::new(SchemaRegistry::new()))
        .await
        .unwrap();
    assert_eq!(again.spec, out.spec);
    assert!(again.warnings.is_empty());
}
