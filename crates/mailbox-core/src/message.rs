//! Mailbox message type and its wire codec.
//!
//! A `MailboxMessage` is encoded to a flat string field map before being
//! written with `XADD`, and decoded back from the field map `XREADGROUP`/
//! `XAUTOCLAIM` return. Encoding and decoding are pure and stateless —
//! neither touches the network.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use uuid::Uuid;

/// Default message classification when none is supplied.
pub const DEFAULT_MESSAGE_TYPE: &str = "direct_message";

/// A structured message exchanged between agents over a mailbox stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxMessage {
    pub message_id: String,
    pub sender: String,
    pub recipient: String,
    pub payload: Map<String, Value>,
    pub message_type: String,
    /// Seconds since the Unix epoch, captured at construction. The wire
    /// format is decimal text; callers should not rely on sub-millisecond
    /// precision surviving a round trip through the log.
    pub timestamp: f64,
}

impl MailboxMessage {
    /// Construct a new message, stamping `timestamp` at call time.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: Map<String, Value>,
        message_type: Option<String>,
        message_id: Option<String>,
    ) -> Self {
        Self {
            message_id: message_id.unwrap_or_else(random_message_id),
            sender: sender.into(),
            recipient: recipient.into(),
            payload,
            message_type: message_type.unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string()),
            timestamp: now_seconds(),
        }
    }

    /// Encode into the flat field map written to the log via `XADD`.
    ///
    /// Every call produces all six canonical fields (invariant I1).
    pub fn encode(&self) -> Vec<(String, String)> {
        vec![
            ("message_id".to_string(), self.message_id.clone()),
            ("sender".to_string(), self.sender.clone()),
            ("recipient".to_string(), self.recipient.clone()),
            (
                "payload".to_string(),
                Value::Object(self.payload.clone()).to_string(),
            ),
            ("message_type".to_string(), self.message_type.clone()),
            ("timestamp".to_string(), self.timestamp.to_string()),
        ]
    }

    /// Decode from a raw field map as returned by the log server.
    ///
    /// Fields are raw bytes because the log server does not guarantee
    /// UTF-8 payloads for arbitrary producers. A missing field, or a
    /// field whose bytes are not valid UTF-8, falls back to that
    /// field's default rather than failing the decode (spec'd: this
    /// path must never crash).
    pub fn decode(fields: &[(String, Vec<u8>)]) -> Self {
        let field = |key: &str| -> Option<String> {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| String::from_utf8(v.clone()).ok())
        };

        let payload = field("payload")
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();

        Self {
            message_id: field("message_id").unwrap_or_else(random_message_id),
            sender: field("sender").unwrap_or_else(|| "unknown".to_string()),
            recipient: field("recipient").unwrap_or_else(|| "unknown".to_string()),
            payload,
            message_type: field("message_type").unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string()),
            timestamp: field("timestamp")
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0),
        }
    }
}

fn random_message_id() -> String {
    Uuid::new_v4().to_string()
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("n".to_string(), Value::from(1));
        m
    }

    fn as_bytes_fields(fields: Vec<(String, String)>) -> Vec<(String, Vec<u8>)> {
        fields
            .into_iter()
            .map(|(k, v)| (k, v.into_bytes()))
            .collect()
    }

    #[test]
    fn round_trip_preserves_observable_fields() {
        let msg = MailboxMessage::new(
            "alice",
            "bob",
            sample_payload(),
            Some("command".to_string()),
            Some("fixed-id".to_string()),
        );

        let decoded = MailboxMessage::decode(&as_bytes_fields(msg.encode()));

        assert_eq!(decoded.message_id, msg.message_id);
        assert_eq!(decoded.sender, msg.sender);
        assert_eq!(decoded.recipient, msg.recipient);
        assert_eq!(decoded.payload, msg.payload);
        assert_eq!(decoded.message_type, msg.message_type);
        assert_eq!(decoded.timestamp, msg.timestamp);
    }

    #[test]
    fn encode_always_carries_all_six_fields() {
        let msg = MailboxMessage::new("a", "b", Map::new(), None, None);
        let fields = msg.encode();
        let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        for expected in [
            "message_id",
            "sender",
            "recipient",
            "payload",
            "message_type",
            "timestamp",
        ] {
            assert!(keys.contains(&expected), "missing field {expected}");
        }
    }

    #[test]
    fn decode_defaults_missing_fields() {
        let decoded = MailboxMessage::decode(&[]);
        assert_eq!(decoded.sender, "unknown");
        assert_eq!(decoded.recipient, "unknown");
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.message_type, DEFAULT_MESSAGE_TYPE);
        assert_eq!(decoded.timestamp, 0.0);
        assert!(!decoded.message_id.is_empty());
    }

    #[test]
    fn decode_tolerates_non_utf8_field() {
        let fields = vec![
            ("sender".to_string(), vec![0xff, 0xfe]),
            ("recipient".to_string(), b"bob".to_vec()),
        ];
        let decoded = MailboxMessage::decode(&fields);
        assert_eq!(decoded.sender, "unknown");
        assert_eq!(decoded.recipient, "bob");
    }

    #[test]
    fn decode_defaults_empty_payload_field() {
        let fields = vec![("payload".to_string(), b"".to_vec())];
        let decoded = MailboxMessage::decode(&fields);
        assert!(decoded.payload.is_empty());
    }
}
