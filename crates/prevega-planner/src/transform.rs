//! Typed transform definitions.
//!
//! Each data entry's `transform` list is parsed into `TransformSpec`s: the raw
//! JSON (kept verbatim so unevaluated transforms can be written back) plus a
//! closed `Transform` enum. Unknown kinds, unknown keys and malformed
//! parameters all land in `Transform::Unsupported`, so a transform is either
//! understood completely or left to the client.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use prevega_core::dag::SortKey;
use prevega_core::expr::Expr;

/// Transform kinds that have a relational lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Extent,
    Bin,
    Filter,
    Aggregate,
    Formula,
    TimeUnit,
    Stack,
    Fold,
    Window,
    Project,
    Collect,
}

impl TransformKind {
    pub const ALL: [TransformKind; 11] = [
        TransformKind::Extent,
        TransformKind::Bin,
        TransformKind::Filter,
        TransformKind::Aggregate,
        TransformKind::Formula,
        TransformKind::TimeUnit,
        TransformKind::Stack,
        TransformKind::Fold,
        TransformKind::Window,
        TransformKind::Project,
        TransformKind::Collect,
    ];

    pub fn parse(s: &str) -> Option<TransformKind> {
        Self::ALL.into_iter().find(|k| k.name() == s)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransformKind::Extent => "extent",
            TransformKind::Bin => "bin",
            TransformKind::Filter => "filter",
            TransformKind::Aggregate => "aggregate",
            TransformKind::Formula => "formula",
            TransformKind::TimeUnit => "timeunit",
            TransformKind::Stack => "stack",
            TransformKind::Fold => "fold",
            TransformKind::Window => "window",
            TransformKind::Project => "project",
            TransformKind::Collect => "collect",
        }
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parameter that is either a literal or a `{"signal": expr}` reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param<T> {
    Signal { signal: String },
    Value(T),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

/// Vega comparator: `{"field": ..., "order": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Compare {
    pub field: OneOrMany<String>,
    #[serde(default)]
    pub order: Option<OneOrMany<String>>,
}

impl Compare {
    pub fn sort_keys(&self) -> Result<Vec<SortKey>, String> {
        let fields = self.field.to_vec();
        let orders = self
            .order
            .as_ref()
            .map(OneOrMany::to_vec)
            .unwrap_or_default();
        fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let descending = match orders.get(i).map(String::as_str) {
                    None | Some("ascending") => false,
                    Some("descending") => true,
                    Some(other) => return Err(format!("invalid sort order '{}'", other)),
                };
                Ok(SortKey {
                    field: field_name(f)?,
                    descending,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterTransform {
    pub expr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormulaTransform {
    pub expr: String,
    #[serde(rename = "as")]
    pub alias: String,
    #[serde(default)]
    pub initonly: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectTransform {
    pub fields: Vec<String>,
    #[serde(rename = "as", default)]
    pub alias: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateTransform {
    #[serde(default)]
    pub groupby: Vec<String>,
    #[serde(default)]
    pub fields: Vec<Option<String>>,
    #[serde(default)]
    pub ops: Vec<String>,
    #[serde(rename = "as", default)]
    pub alias: Vec<Option<String>>,
    #[serde(default)]
    pub cross: Option<bool>,
    #[serde(default)]
    pub drop: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtentTransform {
    pub field: String,
    #[serde(default)]
    pub signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinTransform {
    pub field: String,
    pub extent: Param<Vec<f64>>,
    #[serde(default)]
    pub maxbins: Option<Param<f64>>,
    #[serde(default)]
    pub base: Option<Param<f64>>,
    #[serde(default)]
    pub step: Option<Param<f64>>,
    #[serde(default)]
    pub steps: Option<Vec<f64>>,
    #[serde(default)]
    pub minstep: Option<Param<f64>>,
    #[serde(default)]
    pub divide: Option<Vec<f64>>,
    #[serde(default)]
    pub nice: Option<Param<bool>>,
    #[serde(default)]
    pub span: Option<Param<f64>>,
    #[serde(default)]
    pub interval: Option<bool>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(rename = "as", default)]
    pub alias: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeUnitTransform {
    pub field: String,
    #[serde(default)]
    pub units: Option<Vec<String>>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub interval: Option<bool>,
    #[serde(rename = "as", default)]
    pub alias: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowTransform {
    #[serde(default)]
    pub sort: Option<Compare>,
    #[serde(default)]
    pub groupby: Vec<String>,
    #[serde(default)]
    pub ops: Vec<String>,
    #[serde(default)]
    pub fields: Vec<Option<String>>,
    #[serde(default)]
    pub params: Vec<Option<f64>>,
    #[serde(rename = "as", default)]
    pub alias: Vec<Option<String>>,
    #[serde(default)]
    pub frame: Option<[Option<i64>; 2]>,
    #[serde(rename = "ignorePeers", default)]
    pub ignore_peers: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackTransform {
    pub field: String,
    #[serde(default)]
    pub groupby: Vec<String>,
    #[serde(default)]
    pub sort: Option<Compare>,
    #[serde(default)]
    pub offset: Option<String>,
    #[serde(rename = "as", default)]
    pub alias: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FoldTransform {
    pub fields: Vec<String>,
    #[serde(rename = "as", default)]
    pub alias: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectTransform {
    #[serde(default)]
    pub sort: Option<Compare>,
}

/// Closed set of transforms. Exhaustive matches on this type are the
/// extension point for new transform kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Extent(ExtentTransform),
    Bin(BinTransform),
    Filter(FilterTransform),
    Aggregate(AggregateTransform),
    Formula(FormulaTransform),
    TimeUnit(TimeUnitTransform),
    Stack(StackTransform),
    Fold(FoldTransform),
    Window(WindowTransform),
    Project(ProjectTransform),
    Collect(CollectTransform),
    Unsupported { kind: String, reason: String },
}

impl Transform {
    pub fn kind(&self) -> Option<TransformKind> {
        Some(match self {
            Transform::Extent(_) => TransformKind::Extent,
            Transform::Bin(_) => TransformKind::Bin,
            Transform::Filter(_) => TransformKind::Filter,
            Transform::Aggregate(_) => TransformKind::Aggregate,
            Transform::Formula(_) => TransformKind::Formula,
            Transform::TimeUnit(_) => TransformKind::TimeUnit,
            Transform::Stack(_) => TransformKind::Stack,
            Transform::Fold(_) => TransformKind::Fold,
            Transform::Window(_) => TransformKind::Window,
            Transform::Project(_) => TransformKind::Project,
            Transform::Collect(_) => TransformKind::Collect,
            Transform::Unsupported { .. } => return None,
        })
    }

    /// The `type` string, also for unsupported transforms.
    pub fn kind_name(&self) -> &str {
        match self {
            Transform::Unsupported { kind, .. } => kind,
            other => other.kind().map(|k| k.name()).unwrap_or_default(),
        }
    }
}

fn parse_as<T: DeserializeOwned>(
    body: Value,
    kind: &str,
    wrap: fn(T) -> Transform,
) -> Transform {
    match serde_json::from_value::<T>(body) {
        Ok(t) => wrap(t),
        Err(e) => Transform::Unsupported {
            kind: kind.to_string(),
            reason: e.to_string(),
        },
    }
}

/// One transform: raw JSON plus its parsed form.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformSpec {
    pub raw: Value,
    pub parsed: Transform,
}

impl TransformSpec {
    pub fn parse(raw: &Value) -> TransformSpec {
        TransformSpec {
            raw: raw.clone(),
            parsed: Self::parse_transform(raw),
        }
    }

    fn parse_transform(raw: &Value) -> Transform {
        let Some(obj) = raw.as_object() else {
            return Transform::Unsupported {
                kind: "<invalid>".into(),
                reason: "transform is not an object".into(),
            };
        };
        let Some(kind) = obj.get("type").and_then(Value::as_str) else {
            return Transform::Unsupported {
                kind: "<missing>".into(),
                reason: "transform has no type".into(),
            };
        };
        let mut body = obj.clone();
        body.remove("type");
        let body = Value::Object(body);

        match TransformKind::parse(kind) {
            Some(TransformKind::Extent) => parse_as(body, kind, Transform::Extent),
            Some(TransformKind::Bin) => parse_as(body, kind, Transform::Bin),
            Some(TransformKind::Filter) => parse_as(body, kind, Transform::Filter),
            Some(TransformKind::Aggregate) => parse_as(body, kind, Transform::Aggregate),
            Some(TransformKind::Formula) => parse_as(body, kind, Transform::Formula),
            Some(TransformKind::TimeUnit) => parse_as(body, kind, Transform::TimeUnit),
            Some(TransformKind::Stack) => parse_as(body, kind, Transform::Stack),
            Some(TransformKind::Fold) => parse_as(body, kind, Transform::Fold),
            Some(TransformKind::Window) => parse_as(body, kind, Transform::Window),
            Some(TransformKind::Project) => parse_as(body, kind, Transform::Project),
            Some(TransformKind::Collect) => parse_as(body, kind, Transform::Collect),
            None => Transform::Unsupported {
                kind: kind.to_string(),
                reason: format!(
                    "transform type '{}' has no server-side implementation",
                    kind
                ),
            },
        }
    }

    pub fn kind_name(&self) -> &str {
        self.parsed.kind_name()
    }

    /// Input fields this transform reads, from its raw JSON. Works for
    /// unsupported kinds too, by looking at the conventional parameter names.
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            let name = field_name(name).unwrap_or_else(|_| name.to_string());
            if !out.contains(&name) {
                out.push(name);
            }
        };
        let Some(obj) = self.raw.as_object() else {
            return Vec::new();
        };
        let visit_strings = |v: Option<&Value>, push: &mut dyn FnMut(&str)| match v {
            Some(Value::String(s)) => push(s),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .for_each(|s| push(s)),
            _ => {}
        };
        visit_strings(obj.get("field"), &mut push);
        visit_strings(obj.get("fields"), &mut push);
        visit_strings(obj.get("groupby"), &mut push);
        visit_strings(obj.get("sort").and_then(|s| s.get("field")), &mut push);
        if let Some(expr) = obj.get("expr").and_then(Value::as_str) {
            if let Ok(e) = Expr::parse(expr) {
                e.referenced_fields().iter().for_each(|f| push(f.as_str()));
            }
        }
        out
    }
}

/// Resolve a Vega field string to a flat column name. Escaped dots and
/// brackets (`a\.b`) are unescaped; unescaped ones denote nested access,
/// which has no columnar meaning here.
pub fn field_name(s: &str) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            },
            '.' | '[' | ']' => {
                return Err(format!("nested field access '{}' is not supported", s));
            }
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return Err("empty field name".into());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_kinds() {
        let t = TransformSpec::parse(&json!({"type": "filter", "expr": "datum.a > 1"}));
        assert_eq!(t.parsed.kind(), Some(TransformKind::Filter));

        let t = TransformSpec::parse(&json!({
            "type": "bin", "field": "x", "extent": {"signal": "x_extent"},
            "maxbins": 10, "signal": "bins", "as": ["b0", "b1"]
        }));
        match t.parsed {
            Transform::Bin(b) => {
                let signal = "x_extent".to_string();
                assert_eq!(b.extent, Param::Signal { signal });
                assert_eq!(b.maxbins, Some(Param::Value(10.0)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_kinds_and_keys_are_unsupported() {
        let t = TransformSpec::parse(&json!({"type": "pivot", "field": "k", "value": "v"}));
        assert!(matches!(t.parsed, Transform::Unsupported { ref kind, .. } if kind == "pivot"));
        assert_eq!(t.kind_name(), "pivot");
        assert_eq!(t.referenced_fields(), vec!["k"]);

        let t = TransformSpec::parse(&json!({"type": "bin", "field": "x", "extent": [0, 1], "anchor": 0.5}));
        assert!(matches!(t.parsed, Transform::Unsupported { .. }));
    }

    #[test]
    fn referenced_fields_cover_expr_and_sort() {
        let t = TransformSpec::parse(&json!({
            "type": "window", "sort": {"field": ["a\\.b"]}, "groupby": ["g"],
            "ops": ["rank"]
        }));
        assert_eq!(t.referenced_fields(), vec!["g", "a.b"]);
        let t = TransformSpec::parse(&json!({"type": "formula", "expr": "datum.x * 2", "as": "y"}));
        assert_eq!(t.referenced_fields(), vec!["x"]);
    }

    #[test]
    fn compare_builds_sort_keys() {
        let c: Compare = serde_json::from_value(json!({
            "field": ["a", "b"], "order": ["descending"]
        }))
        .unwrap();
        let keys = c.sort_keys().unwrap();
        assert_eq!(keys, vec![SortKey::desc("a"), SortKey::asc("b")]);
        assert!(field_name("a.b").is_err());
    }
}
