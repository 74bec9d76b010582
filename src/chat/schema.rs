/// Response-format validation.
///
/// A deliberate subset of JSON Schema: `type`, `properties`/`required`,
/// `items`, `minimum`/`maximum`, and `enum`. The generated text must parse
/// as JSON and satisfy the schema; anything else fails with a path-tagged
/// reason. Not a general validator and not trying to become one.
use serde_json::Value;

/// Validate `text` against `schema`. `Ok(())` or a human-readable reason.
pub fn validate_json_schema(text: &str, schema: &Value) -> Result<(), String> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| format!("output is not valid JSON: {}", e))?;
    validate_value(&value, schema, "$")
}

fn validate_value(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{}: value not in enum", path));
        }
    }

    if let Some(ty) = schema.get("type").and_then(Value::as_str) {
        let ok = match ty {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            other => return Err(format!("{}: unsupported schema type {:?}", path, other)),
        };
        if !ok {
            return Err(format!("{}: expected {}", path, ty));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("{}: {} below minimum {}", path, n, min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("{}: {} above maximum {}", path, n, max));
            }
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    return Err(format!("{}: missing required field {:?}", path, name));
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (name, sub_schema) in props {
                if let Some(sub_value) = obj.get(name) {
                    validate_value(sub_value, sub_schema, &format!("{}.{}", path, name))?;
                }
            }
        }
    }

    if let Some(arr) = value.as_array() {
        if let Some(items) = schema.get("items") {
            for (i, item) in arr.iter().enumerate() {
                validate_value(item, items, &format!("{}[{}]", path, i))?;
            }
        }
    }

    Ok(())
}
