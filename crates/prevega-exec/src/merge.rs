//! Write evaluated datasets back into the specification.
//!
//! A full result replaces the entry's upstream and whole transform list with
//! inline `values` (or a `url` reference plus `query` in vendor mode). A
//! partial result replaces the upstream and the folded prefix only; the
//! first remaining transform must find every field it reads in the computed
//! table, otherwise the entry is left as it was. Other keys keep their
//! position in the entry.

use serde_json::{json, Map, Value};
use tracing::debug;

use prevega_core::error::{Error, Result};
use prevega_core::warning::{Diagnostics, Warning, WarningKind};
use prevega_planner::{Specification, TransformSpec};

use crate::metrics::record_warning;
use crate::result::ExecutionResult;

/// Keys that name where an entry's rows come from.
const UPSTREAM_KEYS: [&str; 3] = ["source", "url", "values"];

pub fn merge(
    spec: &Specification,
    results: &[ExecutionResult],
    diagnostics: &Diagnostics,
) -> Result<Specification> {
    let mut out = spec.clone();
    if results.is_empty() {
        return Ok(out);
    }

    let mut signals: Vec<(String, Value)> = Vec::new();
    {
        let data = out
            .data_mut()
            .ok_or_else(|| Error::Invariant("specification has no data array".into()))?;
        for result in results {
            let pos = data
                .iter()
                .position(|entry| {
                    entry.get("name").and_then(Value::as_str) == Some(result.dataset_name.as_str())
                })
                .ok_or_else(|| {
                    Error::Invariant(format!("no data entry named '{}'", result.dataset_name))
                })?;
            let entry = data[pos].as_object().ok_or_else(|| {
                Error::Invariant(format!("data entry '{}' is not an object", result.dataset_name))
            })?;

            match rewrite_entry(entry, result) {
                Ok(rewritten) => {
                    debug!(
                        dataset = %result.dataset_name,
                        folded = result.folded,
                        partial = result.partial,
                        "merged result"
                    );
                    data[pos] = Value::Object(rewritten);
                    signals.extend(result.signals.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Err(message) => record_warning(
                    diagnostics,
                    Warning::new(WarningKind::SchemaMismatch, &result.dataset_name, message),
                ),
            }
        }
    }

    write_signals(&mut out, signals)?;
    Ok(out)
}

fn rewrite_entry(
    entry: &Map<String, Value>,
    result: &ExecutionResult,
) -> std::result::Result<Map<String, Value>, String> {
    let remaining: Vec<Value> = if result.partial {
        entry
            .get("transform")
            .and_then(Value::as_array)
            .map(|t| t[result.folded.min(t.len())..].to_vec())
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    if let Some(first) = remaining.first() {
        let available = match &result.table {
            Some(table) => table.schema(),
            None => result.source_plan.schema().map_err(|e| e.to_string())?,
        };
        let next = TransformSpec::parse(first);
        let missing: Vec<String> = next
            .referenced_fields()
            .into_iter()
            .filter(|f| !available.contains(f))
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "remaining transform '{}' reads {:?}, which the pre-evaluated prefix does not produce",
                next.kind_name(),
                missing
            ));
        }
    }

    let mut data_keys: Vec<(String, Value)> = match (&result.table, &result.reference_url) {
        (Some(table), _) => vec![("values".into(), Value::Array(table.to_json_rows()))],
        (None, Some(url)) => {
            let mut keys = vec![("url".to_string(), Value::String(url.clone()))];
            if let Some(query) = &result.generated_query {
                keys.push(("query".into(), Value::String(query.clone())));
            }
            keys
        }
        (None, None) => return Err("result carries neither rows nor a reference".into()),
    };

    let mut out = Map::new();
    for (key, value) in entry {
        match key.as_str() {
            k if UPSTREAM_KEYS.contains(&k) => out.extend(data_keys.drain(..)),
            "format" => {}
            "transform" => {
                if !remaining.is_empty() {
                    out.insert(key.clone(), Value::Array(remaining.clone()));
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out.extend(data_keys);
    Ok(out)
}

/// Declare computed signals at the top level, overwriting same-named ones.
fn write_signals(spec: &mut Specification, signals: Vec<(String, Value)>) -> Result<()> {
    if signals.is_empty() {
        return Ok(());
    }
    let declared = spec
        .signals_mut()
        .ok_or_else(|| Error::MalformedSpec("top-level signals is not an array".into()))?;
    for (name, value) in signals {
        if let Some(existing) = declared
            .iter_mut()
            .find(|s| s.get("name").and_then(Value::as_str) == Some(name.as_str()))
            .and_then(Value::as_object_mut)
        {
            existing.remove("update");
            existing.insert("value".into(), value);
            continue;
        }
        declared.push(json!({ "name": name, "value": value }));
    }
    Ok(())
}
