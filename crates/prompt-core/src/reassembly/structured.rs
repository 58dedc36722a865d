use serde_json::{Map, Value};

use crate::output::FunctionSchema;

/// Parse a function-call payload as a key/value map.
///
/// Returns `None` for anything that is not a JSON object, or that names none
/// of the schema's required properties.
pub fn parse_payload(payload: &str, schema: Option<&FunctionSchema>) -> Option<Map<String, Value>> {
    let map = match serde_json::from_str::<Value>(payload.trim()) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            tracing::warn!("Structured payload is not an object, skipping");
            return None;
        }
        Err(e) => {
            tracing::warn!("Malformed structured payload, skipping: {}", e);
            return None;
        }
    };

    if let Some(schema) = schema {
        let required = schema.required();
        if !required.is_empty() && !required.iter().any(|r| map.contains_key(*r)) {
            tracing::warn!(
                "Structured payload has none of the required properties {:?}, skipping",
                required
            );
            return None;
        }
    }

    Some(map)
}

/// Merge `next` into `merged`: arrays concatenate, anything else is replaced.
pub fn merge_into(merged: &mut Map<String, Value>, next: Map<String, Value>) {
    for (key, value) in next {
        match (merged.get_mut(&key), value) {
            (Some(Value::Array(existing)), Value::Array(items)) => existing.extend(items),
            (_, value) => {
                merged.insert(key, value);
            }
        }
    }
}
