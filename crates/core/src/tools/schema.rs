//! Argument validation against the JSON-schema subset tool descriptors use:
//! object type, `required`, per-property `type`, `enum`, `minimum`/`maximum`.
//! Anything else in the schema is accepted without checking.

use serde_json::{Map, Value};

/// Checks `args` against a tool's parameter schema. The error message is
/// meant for the model, which sees it as structured tool output.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };
    if let Some(expected) = schema.get("type") {
        check_type("arguments", expected, args)?;
    }
    let Some(fields) = args.as_object() else {
        // Schema without a type but with properties still implies an object.
        if schema.contains_key("properties") {
            return Err(format!(
                "Arguments must be an object, got '{}'",
                json_type_name(args)
            ));
        }
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                return Err(format!("Missing required field: {}", name));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in fields {
            if let Some(property) = properties.get(name).and_then(Value::as_object) {
                validate_property(name, value, property)?;
            }
        }
    }
    Ok(())
}

fn validate_property(name: &str, value: &Value, schema: &Map<String, Value>) -> Result<(), String> {
    if let Some(expected) = schema.get("type") {
        check_type(name, expected, value)?;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let listed: Vec<String> = allowed.iter().map(Value::to_string).collect();
            return Err(format!(
                "Field '{}' must be one of: [{}], got {}",
                name,
                listed.join(", "),
                value
            ));
        }
    }

    if let Some(num) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if num < min {
                return Err(format!("Field '{}' must be >= {}, got {}", name, min, num));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if num > max {
                return Err(format!("Field '{}' must be <= {}, got {}", name, max, num));
            }
        }
    }

    Ok(())
}

/// `type` may be a single name or a list of alternatives.
fn check_type(name: &str, expected: &Value, value: &Value) -> Result<(), String> {
    let names: Vec<&str> = match expected {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => return Ok(()),
    };
    if names.is_empty() || names.iter().any(|t| type_matches(t, value)) {
        return Ok(());
    }
    Err(format!(
        "Field '{}' must be of type '{}', got '{}'",
        name,
        names.join("|"),
        json_type_name(value)
    ))
}

fn type_matches(type_name: &str, value: &Value) -> bool {
    match type_name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
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
