//! Signal values known at planning time.
//!
//! A signal is *static* when its value can be frozen now: a literal `value`,
//! or an `update` expression over other static signals. Signals driven by
//! user input (`bind`, `on`) are *interactive*; freezing them would break the
//! chart's interactivity, so they only count as static when the caller opts
//! out of preserving it.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use prevega_core::expr::Expr;

use crate::spec::Specification;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalValue {
    Static(Value),
    Interactive,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct SignalScope {
    statics: BTreeMap<String, Value>,
    interactive: BTreeSet<String>,
}

impl SignalScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_spec(spec: &Specification, preserve_interactivity: bool) -> Self {
        let mut scope = SignalScope::new();

        // Implicit sizing signals.
        for key in ["width", "height"] {
            if let Some(v) = spec.as_value().get(key).filter(|v| v.is_number()) {
                scope.statics.insert(key.to_string(), v.clone());
            }
        }

        let mut pending: Vec<(String, String)> = Vec::new();
        for signal in spec.signals() {
            let Some(name) = signal.get("name").and_then(Value::as_str) else {
                continue;
            };
            let interactive = signal.get("bind").is_some() || signal.get("on").is_some();
            if interactive && preserve_interactivity {
                scope.statics.remove(name);
                scope.interactive.insert(name.to_string());
                continue;
            }
            let update = signal
                .get("update")
                .or_else(|| signal.get("init"))
                .and_then(Value::as_str);
            match (update, signal.get("value")) {
                // With interactivity dropped, a bound signal keeps its initial value.
                (_, Some(v)) if interactive => {
                    scope.statics.insert(name.to_string(), v.clone());
                }
                (Some(expr), _) => pending.push((name.to_string(), expr.to_string())),
                (None, Some(v)) => {
                    scope.statics.insert(name.to_string(), v.clone());
                }
                (None, None) => {
                    scope.statics.insert(name.to_string(), Value::Null);
                }
            }
        }

        // Update expressions may reference signals declared after them.
        loop {
            let before = pending.len();
            pending.retain(|(name, src)| match scope.evaluate(src) {
                Ok(v) => {
                    scope.statics.insert(name.clone(), v);
                    false
                }
                Err(_) => true,
            });
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        for (name, src) in pending {
            let depends_on_interactive = Expr::parse(&src)
                .map(|e| {
                    e.referenced_signals()
                        .iter()
                        .any(|s| scope.interactive.contains(s))
                })
                .unwrap_or(false);
            if depends_on_interactive {
                scope.interactive.insert(name);
            }
        }
        scope
    }

    pub fn lookup(&self, name: &str) -> SignalValue {
        if let Some(v) = self.statics.get(name) {
            SignalValue::Static(v.clone())
        } else if self.interactive.contains(name) {
            SignalValue::Interactive
        } else {
            SignalValue::Unknown
        }
    }

    pub fn static_value(&self, name: &str) -> Option<Value> {
        self.statics.get(name).cloned()
    }

    pub fn insert_static(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.interactive.remove(&name);
        self.statics.insert(name, value);
    }

    /// Evaluate a signal expression using only static signals.
    ///
    /// A bare signal name returns the stored JSON value unchanged (arrays and
    /// objects included); other expressions evaluate to a scalar.
    pub fn evaluate(&self, src: &str) -> Result<Value, String> {
        let expr = Expr::parse(src).map_err(|e| e.to_string())?;
        if !expr.referenced_fields().is_empty() {
            return Err(format!("signal expression '{}' reads datum fields", src));
        }
        for name in expr.referenced_signals() {
            match self.lookup(&name) {
                SignalValue::Static(_) => {}
                SignalValue::Interactive => {
                    return Err(format!("signal '{}' is interactive", name));
                }
                SignalValue::Unknown => return Err(format!("signal '{}' is not known", name)),
            }
        }
        if let Expr::Signal { name, path } = &expr {
            if path.is_empty() {
                return self
                    .static_value(name)
                    .ok_or_else(|| format!("signal '{}' is not known", name));
            }
        }
        let bound = expr
            .bind_signals(&|name| self.static_value(name))
            .map_err(|e| e.to_string())?;
        bound
            .eval_constant()
            .map(|s| s.to_json())
            .map_err(|e| e.to_string())
    }

    /// Names of statically known signals.
    pub fn static_names(&self) -> impl Iterator<Item = &str> {
        self.statics.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> Specification {
        Specification::new(json!({
            "width": 400,
            "signals": [
                {"name": "maxbins", "value": 15, "bind": {"input": "range"}},
                {"name": "half", "update": "width / 2"},
                {"name": "late", "update": "early + 1"},
                {"name": "early", "value": 1},
                {"name": "derived", "update": "maxbins * 2"},
                {"name": "hover", "value": null, "on": [{"events": "mouseover", "update": "datum"}]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn classifies_signals() {
        let scope = SignalScope::from_spec(&spec(), true);
        assert_eq!(scope.lookup("width"), SignalValue::Static(json!(400)));
        assert_eq!(scope.lookup("half"), SignalValue::Static(json!(200.0)));
        assert_eq!(scope.lookup("late"), SignalValue::Static(json!(2.0)));
        assert_eq!(scope.lookup("maxbins"), SignalValue::Interactive);
        assert_eq!(scope.lookup("derived"), SignalValue::Interactive);
        assert_eq!(scope.lookup("hover"), SignalValue::Interactive);
        assert_eq!(scope.lookup("nope"), SignalValue::Unknown);
    }

    #[test]
    fn dropping_interactivity_freezes_initial_values() {
        let scope = SignalScope::from_spec(&spec(), false);
        assert_eq!(scope.lookup("maxbins"), SignalValue::Static(json!(15)));
        assert_eq!(scope.lookup("derived"), SignalValue::Static(json!(30.0)));
    }

    #[test]
    fn bare_names_keep_structured_values() {
        let mut scope = SignalScope::new();
        scope.insert_static("ext", json!([0, 10]));
        assert_eq!(scope.evaluate("ext").unwrap(), json!([0, 10]));
        assert_eq!(scope.evaluate("ext[1] - ext[0]").unwrap(), json!(10.0));
        assert!(scope.evaluate("datum.x").is_err());
    }
}
