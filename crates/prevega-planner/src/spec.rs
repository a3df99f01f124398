//! Thin wrapper over the JSON specification document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use prevega_core::error::{Error, Result};

/// A visualization specification. Key order is preserved end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Specification(pub Value);

impl Specification {
    pub fn new(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::MalformedSpec(
                "specification must be a JSON object".into(),
            ));
        }
        Ok(Self(value))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(s)
            .map_err(|e| Error::MalformedSpec(format!("invalid JSON: {}", e)))?;
        Self::new(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Top-level `data` entries (empty when absent).
    pub fn data(&self) -> &[Value] {
        self.0
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn data_mut(&mut self) -> Option<&mut Vec<Value>> {
        self.0.get_mut("data").and_then(Value::as_array_mut)
    }

    /// Top-level `signals` entries (empty when absent).
    pub fn signals(&self) -> &[Value] {
        self.0
            .get("signals")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Mutable `signals` array, created when missing.
    pub fn signals_mut(&mut self) -> Option<&mut Vec<Value>> {
        let obj: &mut Map<String, Value> = self.0.as_object_mut()?;
        obj.entry("signals")
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
    }

    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_objects() {
        assert!(Specification::new(json!([1, 2])).is_err());
        assert!(Specification::from_json_str("{").is_err());
    }

    #[test]
    fn signals_array_is_created_at_the_end() {
        let mut spec = Specification::new(json!({"data": [], "width": 10})).unwrap();
        assert!(spec.signals().is_empty());
        spec.signals_mut()
            .unwrap()
            .push(json!({"name": "s", "value": 1}));
        assert_eq!(
            spec.to_json_string(),
            r#"{"data":[],"width":10,"signals":[{"name":"s","value":1}]}"#
        );
    }
}
