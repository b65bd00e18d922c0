//! Sanitize render context data before it enters the sandbox.
//!
//! Removes the ability to smuggle `__proto__`, `constructor` or `prototype`
//! keys into the context object that bundle code receives.

use serde_json::{Map, Value};

use crate::error::{RenderError, Result};

/// Maximum recursion depth for nested objects/arrays
const MAX_DEPTH: usize = 32;

/// Keys that could be used for prototype pollution
const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Check every caller-supplied context field, erroring on the first offence.
pub fn sanitize_context_data(data: &Map<String, Value>) -> Result<()> {
    check_map(data, 0)
}

fn check_map(map: &Map<String, Value>, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(RenderError::InvalidContext(format!(
            "nesting too deep (max {MAX_DEPTH} levels)"
        )));
    }
    for (key, value) in map {
        if DANGEROUS_KEYS.contains(&key.as_str()) {
            return Err(RenderError::InvalidContext(format!(
                "'{key}' key is forbidden"
            )));
        }
        check_value(value, depth + 1)?;
    }
    Ok(())
}

fn check_value(value: &Value, depth: usize) -> Result<()> {
    match value {
        Value::Object(map) => check_map(map, depth),
        Value::Array(items) => {
            if depth > MAX_DEPTH {
                return Err(RenderError::InvalidContext(format!(
                    "nesting too deep (max {MAX_DEPTH} levels)"
                )));
            }
            items.iter().try_for_each(|v| check_value(v, depth + 1))
        }
        // Primitives are safe
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_safe_context() {
        let data = map(json!({
            "url": "/home",
            "user": { "name": "Alice", "settings": { "theme": "dark" } },
            "items": [1, 2, { "nested": true }]
        }));
        assert!(sanitize_context_data(&data).is_ok());
    }

    #[test]
    fn test_blocks_proto() {
        let data = map(json!({ "user": { "__proto__": { "isAdmin": true } } }));
        let err = sanitize_context_data(&data).unwrap_err();
        assert!(err.to_string().contains("__proto__"));
    }

    #[test]
    fn test_blocks_constructor_inside_array() {
        let data = map(json!({ "items": [{ "constructor": {} }] }));
        assert!(matches!(
            sanitize_context_data(&data),
            Err(RenderError::InvalidContext(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!("leaf");
        for _ in 0..40 {
            value = json!({ "nested": value });
        }
        let err = sanitize_context_data(&map(value)).unwrap_err();
        assert!(err.to_string().contains("too deep"));
    }
}
