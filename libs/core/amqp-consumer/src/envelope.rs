//! Stored representation of a received message.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Format used for the human-readable receive time.
pub const RECEIVED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One received message plus the time it arrived.
///
/// The serialized field names (`message`, `timestamp`, `received_at`) are the
/// on-disk and HTTP format; they must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Decoded JSON body, or the body as a string when it is not JSON
    #[serde(rename = "message")]
    pub content: Value,

    /// Seconds since the UNIX epoch, with sub-second precision
    #[serde(rename = "timestamp")]
    pub received_at_epoch: f64,

    /// Local wall-clock time, `YYYY-MM-DD HH:MM:SS`
    #[serde(rename = "received_at")]
    pub received_at_formatted: String,
}

impl MessageEnvelope {
    pub fn new(content: Value, received_at: DateTime<Local>) -> Self {
        Self {
            content,
            received_at_epoch: received_at.timestamp_micros() as f64 / 1_000_000.0,
            received_at_formatted: received_at.format(RECEIVED_AT_FORMAT).to_string(),
        }
    }

    /// Envelope stamped with the current time.
    pub fn received_now(content: Value) -> Self {
        Self::new(content, Local::now())
    }
}

/// How a delivery body was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Json,
    Text,
}

/// Decode a delivery body.
///
/// JSON is tried first. Anything that is not valid JSON is kept as text
/// (invalid UTF-8 sequences are replaced), so decoding never fails.
pub fn decode_body(body: &[u8]) -> (Value, BodyEncoding) {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => (value, BodyEncoding::Json),
        Err(_) => (
            Value::String(String::from_utf8_lossy(body).into_owned()),
            BodyEncoding::Text,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_decode_json_object() {
        let (value, encoding) = decode_body(br#"{"id":1}"#);
        assert_eq!(value, json!({"id": 1}));
        assert_eq!(encoding, BodyEncoding::Json);
    }

    #[test]
    fn test_decode_json_scalars() {
        assert_eq!(decode_body(b"42").0, json!(42));
        assert_eq!(decode_body(br#""hello""#).0, json!("hello"));
        assert_eq!(decode_body(b"null").0, Value::Null);
    }

    #[test]
    fn test_decode_keeps_large_numbers_exact() {
        let body = br#"{"id":123456789012345678901234567890,"price":0.1000000000000000055511151231257827}"#;
        let (value, encoding) = decode_body(body);

        assert_eq!(encoding, BodyEncoding::Json);
        assert_eq!(value.to_string().as_bytes(), body);

        let envelope = MessageEnvelope::received_now(value);
        let stored = serde_json::to_string(&envelope).unwrap();
        assert!(stored.contains(r#""id":123456789012345678901234567890"#));
    }

    #[test]
    fn test_decode_falls_back_to_text() {
        let (value, encoding) = decode_body(b"plain text, not json");
        assert_eq!(value, json!("plain text, not json"));
        assert_eq!(encoding, BodyEncoding::Text);
    }

    #[test]
    fn test_decode_empty_body_is_text() {
        let (value, encoding) = decode_body(b"");
        assert_eq!(value, json!(""));
        assert_eq!(encoding, BodyEncoding::Text);
    }

    #[test]
    fn test_decode_invalid_utf8_is_lossy() {
        let (value, encoding) = decode_body(&[0x66, 0x6f, 0xff, 0x6f]);
        assert_eq!(encoding, BodyEncoding::Text);
        assert_eq!(value, json!("fo\u{FFFD}o"));
    }

    #[test]
    fn test_envelope_timestamps() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let envelope = MessageEnvelope::new(json!({"id": 1}), at);

        assert_eq!(envelope.received_at_formatted, "2024-03-09 14:05:07");
        assert_eq!(envelope.received_at_epoch, at.timestamp() as f64);
    }

    #[test]
    fn test_envelope_wire_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let envelope = MessageEnvelope::new(json!("hi"), at);
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["message"], json!("hi"));
        assert_eq!(value["received_at"], json!("2024-03-09 14:05:07"));
        assert!(value["timestamp"].is_f64());
    }
}
