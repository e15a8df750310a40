//! Schema-less JSON helpers for the bridge backend.
//!
//! - `substitute` fills the prompt into a request template
//! - `extract` digs the generated text out of a decoded response line

use serde_json::Value;

/// Exact string value replaced by the prompt text.
pub const PROMPT_PLACEHOLDER: &str = "<PROMPT>";

/// Replace every string value exactly equal to `placeholder` with `replacement`.
///
/// Consumes the tree and rebuilds it in one pass. Object keys and partial
/// matches inside longer strings are left alone, and `replacement` is never
/// scanned again.
pub fn substitute(value: Value, placeholder: &str, replacement: &str) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute(v, placeholder, replacement)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute(v, placeholder, replacement))
                .collect(),
        ),
        Value::String(s) if s == placeholder => Value::String(replacement.to_string()),
        other @ (Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null) => other,
    }
}

/// Find `field` anywhere in the tree and return its value as text.
///
/// A direct key of the current object wins over anything nested below it,
/// even when it holds an empty string. Otherwise children are searched in
/// map/array order and the first non-empty hit is returned. A non-string
/// value yields a diagnostic instead of its raw form.
pub fn extract(value: &Value, field: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(field) {
                return Some(match found {
                    Value::String(s) => s.clone(),
                    other => format!("found, but not a string: {}", kind(other)),
                });
            }
            map.values().find_map(|v| extract_non_empty(v, field))
        }
        Value::Array(items) => items.iter().find_map(|v| extract_non_empty(v, field)),
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null => None,
    }
}

fn extract_non_empty(value: &Value, field: &str) -> Option<String> {
    extract(value, field).filter(|s| !s.is_empty())
}

pub fn kind(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "bool",
        Value::Null => "null",
    }
}
