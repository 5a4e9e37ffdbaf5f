//! Connection-creation response parsing
//!
//! Gateways answer a create request with one of three shapes: an object
//! carrying `identifier`, a bare identifier string, or a single-key map whose
//! value holds the identifier (the key itself is used when it does not).

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CreateResponse {
    Identified { identifier: String },
    Bare(String),
    Keyed(BTreeMap<String, Value>),
}

/// Extract the new connection's identifier
pub fn connection_identifier(body: Value) -> Result<String, String> {
    let shape = serde_json::from_value::<CreateResponse>(body.clone())
        .map_err(|_| unrecognized(&body))?;

    let id = match shape {
        CreateResponse::Identified { identifier } => identifier,
        CreateResponse::Bare(id) => id,
        CreateResponse::Keyed(map) if map.len() == 1 => match map.into_iter().next() {
            Some((key, value)) if key != "identifier" => value
                .get("identifier")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or(key),
            _ => return Err(unrecognized(&body)),
        },
        CreateResponse::Keyed(_) => return Err(unrecognized(&body)),
    };

    if id.is_empty() {
        return Err(unrecognized(&body));
    }
    Ok(id)
}

fn unrecognized(body: &Value) -> String {
    let kind = match body {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "empty string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    format!("unrecognized create response shape ({})", kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identifier_object() {
        let body = json!({"identifier": "42", "name": "x", "protocol": "rdp"});
        assert_eq!(connection_identifier(body).unwrap(), "42");
    }

    #[test]
    fn test_bare_string() {
        assert_eq!(connection_identifier(json!("17")).unwrap(), "17");
    }

    #[test]
    fn test_single_key_map() {
        let nested = json!({"abc": {"identifier": "9", "name": "x"}});
        assert_eq!(connection_identifier(nested).unwrap(), "9");

        let key_only = json!({"55": {"name": "x"}});
        assert_eq!(connection_identifier(key_only).unwrap(), "55");
    }

    #[test]
    fn test_unrecognized() {
        for body in [
            json!(null),
            json!(7),
            json!([]),
            json!(""),
            json!({}),
            json!({"a": {}, "b": {}}),
            json!({"identifier": 5}),
        ] {
            assert!(connection_identifier(body).is_err());
        }
    }
}
