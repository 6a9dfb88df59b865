use serde_json::{Map, Value};

use crate::utils::error::CableError;

/// A subscription identifier split into its channel name and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedIdentifier {
    pub channel: String,
    pub params: Map<String, Value>,
}

/// Canonical identifier for `channel` with `params`: a JSON object with
/// every key, nested ones included, in sorted order.
///
/// The wire never re-serializes identifiers; clients echo whatever string
/// they subscribed with. This is for servers and tools that need to build
/// the same string a client would.
pub fn build(channel: &str, params: &Map<String, Value>) -> String {
    let mut object = Map::new();
    object.insert("channel".to_string(), Value::String(channel.to_string()));
    for (key, value) in params {
        if key != "channel" {
            object.insert(key.clone(), value.clone());
        }
    }
    canonicalize(&Value::Object(object)).to_string()
}

pub fn parse(identifier: &str) -> Result<ParsedIdentifier, CableError> {
    let invalid = || CableError::InvalidIdentifier(identifier.to_string());

    let Value::Object(mut object) = serde_json::from_str::<Value>(identifier).map_err(|_| invalid())?
    else {
        return Err(invalid());
    };
    let channel = match object.remove("channel") {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => return Err(invalid()),
    };
    Ok(ParsedIdentifier {
        channel,
        params: object,
    })
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&object[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
