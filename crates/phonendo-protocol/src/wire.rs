//! UTF-8 payload conventions shared by every operation.
//!
//! - Composite requests are `key##json`. The key is opaque but must not
//!   contain `##`; encoding such a key is refused rather than escaped.
//! - Item lists are JSON arrays of `[key, value]` pairs.
//! - A handler failure is answered with `{"error": "<message>"}`.
//! - Statuses are the literal strings `true` / `false`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ProtocolError, KEY_VALUE_DELIMITER, STATUS_FAILED, STATUS_OK};

/// Encode `key##json(value)`.
pub fn encode_keyed(key: &str, value: &Value) -> Result<String, ProtocolError> {
    if key.contains(KEY_VALUE_DELIMITER) {
        return Err(ProtocolError::DelimiterInKey(key.to_string()));
    }
    Ok(format!(
        "{key}{KEY_VALUE_DELIMITER}{}",
        serde_json::to_string(value)?
    ))
}

/// Split a `key##json` payload at the first delimiter and parse the value.
pub fn decode_keyed(payload: &str) -> Result<(String, Value), ProtocolError> {
    let (key, json) = payload
        .split_once(KEY_VALUE_DELIMITER)
        .ok_or(ProtocolError::MissingDelimiter)?;
    let value = serde_json::from_str(json)?;
    Ok((key.to_string(), value))
}

/// Encode an item list as `[[key, value], ...]`.
pub fn encode_items<'a, I>(items: I) -> Result<String, ProtocolError>
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let pairs: Vec<(&str, &Value)> = items.into_iter().collect();
    Ok(serde_json::to_string(&pairs)?)
}

/// Decode an item list produced by [`encode_items`].
pub fn decode_items(payload: &str) -> Result<Vec<(String, Value)>, ProtocolError> {
    Ok(serde_json::from_str(payload)?)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ErrorPayload {
    error: String,
}

/// Build the payload returned when a handler fails.
pub fn encode_error(message: &str) -> String {
    serde_json::to_string(&ErrorPayload {
        error: message.to_string(),
    })
    .unwrap_or_else(|_| String::from(r#"{"error":"unencodable error"}"#))
}

/// Return the message if `payload` is a handler error payload.
pub fn decode_error(payload: &str) -> Option<String> {
    if !payload.trim_start().starts_with('{') {
        return None;
    }
    serde_json::from_str::<ErrorPayload>(payload)
        .ok()
        .map(|p| p.error)
}

pub fn encode_status(ok: bool) -> &'static str {
    if ok {
        STATUS_OK
    } else {
        STATUS_FAILED
    }
}

/// Interpret a boolean-ish status reply. Anything other than a recognised
/// negative is treated as success, matching peers that reply with free text.
pub fn decode_status(payload: &str) -> bool {
    !matches!(
        payload.trim().to_ascii_lowercase().as_str(),
        STATUS_FAILED | "0" | "error" | ""
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keyed_payload() {
        let payload = encode_keyed("k1", &json!({"a": "x"})).unwrap();
        assert_eq!(payload, r#"k1##{"a":"x"}"#);
        let (key, value) = decode_keyed(&payload).unwrap();
        assert_eq!(key, "k1");
        assert_eq!(value, json!({"a": "x"}));
    }

    #[test]
    fn test_delimiter_in_key_is_refused() {
        let err = encode_keyed("a##b", &json!(1)).unwrap_err();
        assert!(matches!(err, ProtocolError::DelimiterInKey(_)));
    }

    #[test]
    fn test_value_may_contain_delimiter() {
        let (key, value) = decode_keyed(r#"k##"x##y""#).unwrap();
        assert_eq!(key, "k");
        assert_eq!(value, json!("x##y"));
    }

    #[test]
    fn test_missing_delimiter() {
        assert!(matches!(
            decode_keyed("no-delimiter"),
            Err(ProtocolError::MissingDelimiter)
        ));
    }

    #[test]
    fn test_items_list() {
        let a = json!({"n": 1});
        let b = json!("two");
        let payload = encode_items([("a", &a), ("b", &b)]).unwrap();
        assert_eq!(payload, r#"[["a",{"n":1}],["b","two"]]"#);
        assert_eq!(decode_items("[]").unwrap(), vec![]);
    }

    #[test]
    fn test_error_payload() {
        let payload = encode_error("boom");
        assert_eq!(decode_error(&payload).as_deref(), Some("boom"));
        assert_eq!(decode_error("phonendo_storage"), None);
        assert_eq!(decode_error(r#"{"source":1,"signature":"ab"}"#), None);
    }

    #[test]
    fn test_status() {
        assert!(decode_status(encode_status(true)));
        assert!(!decode_status(encode_status(false)));
        assert!(!decode_status(" FALSE\n"));
    }
}
