//! Tool-argument validation against a skill's declared JSON schema.
//!
//! This intentionally implements only the subset of JSON Schema the skill
//! registry actually declares — required fields, `type`, `enum`, and
//! numeric `minimum`/`maximum` — rather than pulling in a full JSON Schema
//! engine for a handful of keywords.

use serde_json::Value;

use crate::identifiers::ALLOWED_INTERNAL_PARAMS;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingRequired(String),
    #[error("field '{field}' must be of type {expected}, got {actual}")]
    WrongType { field: String, expected: String, actual: String },
    #[error("field '{field}' must be one of {allowed:?}")]
    NotInEnum { field: String, allowed: Vec<Value> },
    #[error("field '{field}' must be >= {min}")]
    BelowMinimum { field: String, min: f64 },
    #[error("field '{field}' must be <= {max}")]
    AboveMaximum { field: String, max: f64 },
}

/// Validates `arguments` against `schema` (an object with `properties`,
/// `required`, and per-property `type`/`enum`/`minimum`/`maximum`), then
/// returns a filtered copy containing only keys declared in `properties`
/// plus the whitelisted internal pass-through keys (`_parallel`).
///
/// Non-strict: unknown keys are filtered out rather than rejected, matching
/// the "permissive extras" behavior used by the reference implementation —
/// set `strict=true` to reject unknown keys outright instead.
pub fn validate_tool_arguments(
    arguments: &serde_json::Map<String, Value>,
    schema: &Value,
    strict: bool,
) -> Result<serde_json::Map<String, Value>, ValidationError> {
    let empty_props = serde_json::Map::new();
    let properties = schema.get("properties").and_then(Value::as_object).unwrap_or(&empty_props);
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();

    for field in &required {
        if !arguments.contains_key(*field) {
            return Err(ValidationError::MissingRequired(field.to_string()));
        }
    }

    for (key, value) in arguments {
        let Some(prop_schema) = properties.get(key) else {
            if strict && !ALLOWED_INTERNAL_PARAMS.contains(&key.as_str()) {
                return Err(ValidationError::MissingRequired(format!("unexpected field '{key}'")));
            }
            continue;
        };
        check_property(key, value, prop_schema)?;
    }

    let mut filtered = serde_json::Map::new();
    for (key, value) in arguments {
        if properties.contains_key(key) || ALLOWED_INTERNAL_PARAMS.contains(&key.as_str()) {
            filtered.insert(key.clone(), value.clone());
        }
    }
    Ok(filtered)
}

fn check_property(field: &str, value: &Value, prop_schema: &Value) -> Result<(), ValidationError> {
    if let Some(expected) = prop_schema.get("type").and_then(Value::as_str) {
        if !type_matches(value, expected) {
            return Err(ValidationError::WrongType {
                field: field.to_string(),
                expected: expected.to_string(),
                actual: json_type_name(value).to_string(),
            });
        }
    }

    if let Some(allowed) = prop_schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(ValidationError::NotInEnum { field: field.to_string(), allowed: allowed.clone() });
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = prop_schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(ValidationError::BelowMinimum { field: field.to_string(), min });
            }
        }
        if let Some(max) = prop_schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(ValidationError::AboveMaximum { field: field.to_string(), max });
            }
        }
    }

    Ok(())
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "properties": {
                "path": {"type": "string"},
                "mode": {"type": "string", "enum": ["r", "w"]},
                "limit": {"type": "integer", "minimum": 1, "maximum": 100}
            },
            "required": ["path"]
        })
    }

    #[test]
    fn rejects_missing_required_field() {
        let args = json!({"mode": "r"}).as_object().unwrap().clone();
        assert!(matches!(
            validate_tool_arguments(&args, &schema(), false),
            Err(ValidationError::MissingRequired(_))
        ));
    }

    #[test]
    fn rejects_wrong_type() {
        let args = json!({"path": 5}).as_object().unwrap().clone();
        assert!(matches!(
            validate_tool_arguments(&args, &schema(), false),
            Err(ValidationError::WrongType { .. })
        ));
    }

    #[test]
    fn rejects_enum_violation() {
        let args = json!({"path": "/x", "mode": "z"}).as_object().unwrap().clone();
        assert!(matches!(
            validate_tool_arguments(&args, &schema(), false),
            Err(ValidationError::NotInEnum { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_number() {
        let args = json!({"path": "/x", "limit": 500}).as_object().unwrap().clone();
        assert!(matches!(
            validate_tool_arguments(&args, &schema(), false),
            Err(ValidationError::AboveMaximum { .. })
        ));
    }

    #[test]
    fn non_strict_mode_filters_unknown_keys() {
        let args = json!({"path": "/x", "extra": "ignored"}).as_object().unwrap().clone();
        let filtered = validate_tool_arguments(&args, &schema(), false).unwrap();
        assert!(!filtered.contains_key("extra"));
        assert!(filtered.contains_key("path"));
    }

    #[test]
    fn allows_internal_parallel_flag_through() {
        let args = json!({"path": "/x", "_parallel": true}).as_object().unwrap().clone();
        let filtered = validate_tool_arguments(&args, &schema(), true).unwrap();
        assert_eq!(filtered.get("_parallel"), Some(&json!(true)));
    }

    #[test]
    fn strict_mode_rejects_unknown_keys() {
        let args = json!({"path": "/x", "extra": "nope"}).as_object().unwrap().clone();
        assert!(validate_tool_arguments(&args, &schema(), true).is_err());
    }
}
