//! Reconnecting real-time channel.
//!
//! Provides:
//! - Wire codec (JSON envelope)
//! - `RealtimeChannel` - connection driver with backoff and keep-alive
//! - WebSocket connector (feature: websocket)

pub mod channel;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{RealtimeChannel, SendError};
pub use protocol::{CodecError, ConnectAnnouncement};
#[cfg(feature = "websocket")]
pub use websocket::{WsConnector, WsLink};
