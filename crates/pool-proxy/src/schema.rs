//! Gemini only understands a subset of JSON Schema
//! (`type`/`format`/`description`/`nullable`/`enum`/`items`/`properties`/`required`).
//! This strips everything else recursively before a tool definition crosses
//! the wire.

use serde_json::Value;

const ALLOWED_KEYS: &[&str] =
    &["type", "format", "description", "nullable", "enum", "items", "properties", "required"];

/// Recursively drop schema keywords Gemini doesn't support (`default`,
/// `additionalProperties`, `$schema`, etc).
#[must_use]
pub fn sanitize(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut cleaned = serde_json::Map::new();
            for (key, value) in map {
                if !ALLOWED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let sanitized = match key.as_str() {
                    "properties" => Value::Object(
                        value
                            .as_object()
                            .map(|props| props.iter().map(|(k, v)| (k.clone(), sanitize(v))).collect())
                            .unwrap_or_default(),
                    ),
                    "items" => sanitize(value),
                    _ => value.clone(),
                };
                cleaned.insert(key.clone(), sanitized);
            }
            Value::Object(cleaned)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drops_unsupported_keywords() {
        let schema = json!({
            "type": "object",
            "default": {"a": 1},
            "additionalProperties": false,
            "$schema": "http://json-schema.org/draft-07/schema#",
            "properties": {
                "name": {"type": "string", "default": "x"}
            },
            "required": ["name"]
        });
        let cleaned = sanitize(&schema);
        assert!(cleaned.get("default").is_none());
        assert!(cleaned.get("additionalProperties").is_none());
        assert!(cleaned.get("$schema").is_none());
        assert_eq!(cleaned["properties"]["name"].get("default"), None);
        assert_eq!(cleaned["required"][0], "name");
    }

    #[test]
    fn sanitizes_array_item_schemas() {
        let schema = json!({
            "type": "array",
            "items": {"type": "string", "default": "x"}
        });
        let cleaned = sanitize(&schema);
        assert_eq!(cleaned["items"].get("default"), None);
    }
}
