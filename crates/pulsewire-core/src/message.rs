//! Message envelope exchanged over the real-time channel.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved type announcing the client after every successful handshake.
pub const CONNECT: &str = "connect";
/// Reserved keep-alive ping.
pub const PING: &str = "ping";
/// Reserved keep-alive response.
pub const PONG: &str = "pong";
/// Subscription key that receives every application message.
pub const WILDCARD: &str = "*";

/// Current time as an ISO-8601 / RFC 3339 string with millisecond precision.
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A single frame of the wire protocol.
///
/// `kind` is the dispatch key and maps to the `type` field on the wire.
/// An empty `timestamp` means "not stamped yet"; outbound messages are
/// stamped right before they are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: String,
}

impl Message {
    /// Create an unstamped message.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: String::new(),
        }
    }

    /// Create a message from a serializable payload.
    ///
    /// # Errors
    /// Returns error if the payload cannot be represented as JSON.
    pub fn from_payload<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    /// Keep-alive ping.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(PING, Value::Null).stamped()
    }

    /// Keep-alive response.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(PONG, Value::Null).stamped()
    }

    /// Set the timestamp to now unless the caller already supplied one.
    #[must_use]
    pub fn stamped(mut self) -> Self {
        if self.timestamp.is_empty() {
            self.timestamp = now_timestamp();
        }
        self
    }

    /// Whether this is protocol keep-alive traffic.
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        self.kind == PING || self.kind == PONG
    }

    /// Decode the payload into a concrete type.
    ///
    /// # Errors
    /// Returns error if the payload shape does not match `T`.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
