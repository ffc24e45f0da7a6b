//! Canonical JSON serialization for hashing.
//!
//! Object keys are emitted in sorted order with no whitespace, so two
//! logically equal values always serialize to the same byte string
//! regardless of key insertion order.

use serde_json::Value;
use std::collections::BTreeMap;

/// Serializes a JSON value to its canonical textual form.
#[must_use]
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (key, val) in map {
                sorted.insert(key, to_canonical_json(val));
            }
            let parts: Vec<String> = sorted
                .into_iter()
                .map(|(key, val)| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(key).unwrap_or_default(),
                        val
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}
