//! Transport seam between the connection runtime and a concrete socket.

use async_trait::async_trait;
use thiserror::Error;

/// Transport error.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Handshake timed out")]
    Timeout,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Connection closed")]
    Closed,
}

/// Something that happened on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text frame.
    Text(String),
    /// The link closed. `clean` is true only for a normal closure.
    Closed { clean: bool, reason: String },
    /// A read error; the link should be considered dead.
    Error(String),
}

/// One open, bidirectional text connection.
#[async_trait]
pub trait Link: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Wait for the next event. `None` means the stream ended without a
    /// close frame. Must be cancel-safe.
    async fn next_event(&mut self) -> Option<LinkEvent>;

    /// Close the link with a normal closure. Best effort.
    async fn close(&mut self);
}

/// Opens links to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake with `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Link>, TransportError>;
}
