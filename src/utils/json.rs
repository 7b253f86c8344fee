//! Small helpers for pulling numbers out of loosely-typed device JSON.
//!
//! Meters and battery bridges disagree on types: the same field shows up as
//! `42`, `42.5` or `"42.5"` depending on firmware. Both helpers accept all three.

use serde_json::Value;

/// Interprets a JSON value as a number. Numeric strings are accepted.
pub fn number_at(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// Walks `path` (already split on `.`) and returns the number found there.
pub fn lookup_number<S: AsRef<str>>(root: &Value, path: &[S]) -> Option<f64> {
    let mut node = root;
    for segment in path {
        node = node.as_object()?.get(segment.as_ref())?;
    }
    number_at(node)
}
