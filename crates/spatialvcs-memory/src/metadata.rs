//! Scalar coercion for index metadata.
//!
//! The index stores flat maps whose values are strings, integers, floats or
//! booleans.  On the way in, `null` becomes `""` and arrays / objects become
//! their compact JSON text.  On the way out, a string that parses as a JSON
//! array or object is decoded back; every other value passes through as-is.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spatialvcs_types::Metadata;

/// A value the index can hold natively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Metadata in index form.
pub type ScalarMap = BTreeMap<String, ScalarValue>;

impl ScalarValue {
    /// Coerce any JSON value to its index form.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ScalarValue::Str(String::new()),
            Value::Bool(b) => ScalarValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ScalarValue::Int(i),
                None => ScalarValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => ScalarValue::Str(s.clone()),
            structured @ (Value::Array(_) | Value::Object(_)) => {
                ScalarValue::Str(structured.to_string())
            }
        }
    }

    /// Restore the structured form where one was encoded.
    pub fn into_json(self) -> Value {
        match self {
            ScalarValue::Bool(b) => Value::Bool(b),
            ScalarValue::Int(i) => Value::from(i),
            ScalarValue::Float(f) => Value::from(f),
            ScalarValue::Str(s) => decode_structured(&s).unwrap_or(Value::String(s)),
        }
    }
}

fn decode_structured(s: &str) -> Option<Value> {
    let trimmed = s.trim_start();
    if !(trimmed.starts_with('[') || trimmed.starts_with('{')) {
        return None;
    }
    match serde_json::from_str::<Value>(s) {
        Ok(v @ (Value::Array(_) | Value::Object(_))) => Some(v),
        _ => None,
    }
}

/// Coerce a metadata bag for storage.
pub fn to_scalar_map(meta: &Metadata) -> ScalarMap {
    meta.iter()
        .map(|(k, v)| (k.clone(), ScalarValue::from_json(v)))
        .collect()
}

/// Rebuild a metadata bag read from the index.
pub fn from_scalar_map(map: ScalarMap) -> Metadata {
    map.into_iter().map(|(k, v)| (k, v.into_json())).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn meta(v: Value) -> Metadata {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn null_becomes_empty_string() {
        assert_eq!(ScalarValue::from_json(&Value::Null), ScalarValue::Str(String::new()));
    }

    #[test]
    fn scalars_keep_their_type() {
        let m = to_scalar_map(&meta(json!({"a": 3, "b": 1.5, "c": true, "d": "x"})));
        assert_eq!(m["a"], ScalarValue::Int(3));
        assert_eq!(m["b"], ScalarValue::Float(1.5));
        assert_eq!(m["c"], ScalarValue::Bool(true));
        assert_eq!(m["d"], ScalarValue::Str("x".to_string()));
    }

    #[test]
    fn structured_values_round_trip() {
        let original = meta(json!({
            "bbox": [10, 20, 50, 80],
            "position_3d": {"x": 0.5, "y": -0.25, "z": -1.5},
        }));
        let stored = to_scalar_map(&original);
        assert!(matches!(stored["bbox"], ScalarValue::Str(_)));
        assert_eq!(from_scalar_map(stored), original);
    }

    #[test]
    fn numeric_looking_strings_stay_strings() {
        let original = meta(json!({"scan_id": "42", "note": "[not json"}));
        assert_eq!(from_scalar_map(to_scalar_map(&original)), original);
    }

    #[test]
    fn index_form_serialises_flat() {
        let m = to_scalar_map(&meta(json!({"k": 2, "tags": ["a"]})));
        let text = serde_json::to_string(&m).unwrap();
        assert_eq!(text, r#"{"k":2,"tags":"[\"a\"]"}"#);
        let back: ScalarMap = serde_json::from_str(&text).unwrap();
        assert_eq!(back, m);
    }
}
