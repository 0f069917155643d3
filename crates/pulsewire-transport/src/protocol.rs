//! Wire codec for the real-time channel.
//!
//! Every frame is one JSON object:
//! `{ "type": string, "payload": any, "timestamp": ISO-8601 string }`.

use pulsewire_core::{Message, message::CONNECT};
use serde::{Deserialize, Serialize};

/// Codec error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Payload of the `connect` announcement sent after every handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAnnouncement {
    /// Configured client name.
    pub client: String,
    /// Identifier of this channel instance, stable across reconnects.
    pub client_id: String,
}

/// Serialize a message, stamping it if the caller left the timestamp empty.
///
/// # Errors
/// Returns error if the payload cannot be serialized.
pub fn encode(message: Message) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&message.stamped())?)
}

/// Build the announcement frame for a fresh connection.
///
/// # Errors
/// Returns error if serialization fails.
pub fn announcement(client: &str, client_id: &str) -> Result<Message, CodecError> {
    let payload = ConnectAnnouncement {
        client: client.to_string(),
        client_id: client_id.to_string(),
    };
    Ok(Message::from_payload(CONNECT, &payload)?.stamped())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_ok;

    #[test]
    fn test_encode_stamps_missing_timestamp() {
        let json = assert_ok!(encode(Message::new("refresh", json!({"panel": "builds"}))));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "refresh");
        assert_eq!(value["payload"]["panel"], "builds");
        let ts = value["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_encode_keeps_caller_timestamp() {
        let mut msg = Message::new("refresh", json!(null));
        msg.timestamp = "2023-11-14T22:13:20Z".to_string();
        let json = assert_ok!(encode(msg));
        assert!(json.contains("2023-11-14T22:13:20Z"));
    }

    #[test]
    fn test_announcement_shape() {
        let msg = assert_ok!(announcement("ops-dashboard", "abc-123"));
        assert_eq!(msg.kind, "connect");
        assert_eq!(msg.payload, json!({"client": "ops-dashboard", "clientId": "abc-123"}));
        assert!(!msg.timestamp.is_empty());
    }
}
