use serde_json::Value as JsonValue;

/// Redact conversation text from request payloads before they are logged.
/// Message bodies, prompts and attached images are replaced by a length marker
/// so log lines still show the payload shape.
pub fn redact_sensitive_data(data: &JsonValue) -> JsonValue {
    redact_value(data)
}

/// Redacted payload rendered as a single log-friendly string.
pub fn redacted_payload_string(data: &JsonValue) -> String {
    serde_json::to_string(&redact_sensitive_data(data))
        .unwrap_or_else(|_| "\"<redacted>\"".to_string())
}

fn redact_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut redacted_map = serde_json::Map::new();
            for (key, val) in map {
                let redacted_val = if is_sensitive_field(key) {
                    redact_field_value(val)
                } else {
                    redact_value(val)
                };
                redacted_map.insert(key.clone(), redacted_val);
            }
            JsonValue::Object(redacted_map)
        }
        JsonValue::Array(arr) => JsonValue::Array(arr.iter().map(redact_value).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_field(field_name: &str) -> bool {
    let lower = field_name.to_lowercase();
    matches!(
        lower.as_str(),
        "content" | "prompt" | "system" | "template" | "images" | "input" | "arguments"
    )
}

fn redact_field_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) if !s.is_empty() => {
            JsonValue::String(format!("[REDACTED {} chars]", s.chars().count()))
        }
        JsonValue::Array(items) if !items.is_empty() => {
            JsonValue::String(format!("[REDACTED {} items]", items.len()))
        }
        JsonValue::Object(map) if !map.is_empty() => JsonValue::String("[REDACTED]".to_string()),
        _ => value.clone(),
    }
}
