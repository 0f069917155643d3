//! Core abstractions for the pulsewire real-time update channel.
//!
//! This crate provides the socket-free building blocks:
//! - `Message` / `AppMessage` - Wire envelope and typed payloads
//! - `Registry` - Subscriber registry keyed by message type
//! - `Dispatcher` - Frame decoding and keep-alive filtering
//! - `ConnectionMachine` - Connection lifecycle and retry policy
//! - `ChannelConfig` - Channel settings
//! - `Connector` / `Link` - Transport traits

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod machine;
pub mod message;
pub mod payload;
pub mod registry;
pub mod traits;

pub use backoff::BackoffPolicy;
pub use config::{ChannelConfig, ConfigError};
pub use dispatch::{Dispatcher, Inbound};
pub use machine::{
    Action, ChannelError, ConnectionMachine, ConnectionState, ConnectionStatus, MachineEvent,
    ReconnectContext,
};
pub use message::{Message, WILDCARD};
pub use payload::{
    AppMessage, GitActivity, InfraMetric, Payload, PipelineSnapshot, PipelineUpdate, RunNode,
    RunStatus,
};
pub use registry::{Handler, Registry, Subscription};
pub use traits::{Connector, Link, LinkEvent, TransportError};
