//! JSON helpers shared by objects, operations and blocks.
//!
//! All hashed JSON goes through [`canonical_json`]: keys sorted, no
//! whitespace. `serde_json::Map` is a `BTreeMap` unless the
//! `preserve_order` feature is enabled, which this workspace never does.

use serde_json::{Map, Number, Value};

/// Compact JSON with sorted keys.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Structural equality that treats numerically equal numbers as equal
/// (`1` equals `1.0`).
pub fn json_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| json_equals(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| json_equals(v, other)))
        }
        _ => a == b,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    match (x.as_i64(), y.as_i64()) {
        (Some(l), Some(r)) => l == r,
        _ => x.as_f64() == y.as_f64(),
    }
}

/// Same as [`json_equals`] but a missing value equals `null`.
pub fn opt_json_equals(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(Value::Null), None) | (None, Some(Value::Null)) => true,
        (Some(l), Some(r)) => json_equals(l, r),
        _ => false,
    }
}

/// Render a scalar as a plain string. Strings are returned unquoted,
/// everything else in its JSON form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Read a value as a list of strings. `null` and `""` are the empty list,
/// a single scalar becomes a one-element list.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) if s.is_empty() => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
        Some(other) => vec![value_to_string(other)],
    }
}

/// Convert a list of strings into a JSON array.
pub fn string_array<S: AsRef<str>>(items: &[S]) -> Value {
    Value::Array(
        items
            .iter()
            .map(|s| Value::String(s.as_ref().to_string()))
            .collect(),
    )
}

pub(crate) fn into_map(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(m) => Some(m),
        _ => None,
    }
}
