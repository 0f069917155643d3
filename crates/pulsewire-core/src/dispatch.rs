//! Inbound frame decoding and routing.

use crate::{
    message::{Message, PING, PONG, now_timestamp},
    registry::Registry,
};

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Application message delivered to this many handlers.
    Dispatched(usize),
    /// Keep-alive ping from the peer; the caller owes a pong.
    Ping,
    /// Keep-alive response; never surfaced to subscribers.
    Pong,
    /// Not a valid frame; dropped.
    Malformed,
}

/// Decodes raw text frames and forwards application messages.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: Registry,
}

impl Dispatcher {
    /// Create a dispatcher that forwards into `registry`.
    #[must_use]
    pub const fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Registry messages are forwarded to.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Decode one text frame and route it.
    ///
    /// Malformed frames are logged and dropped, never forwarded.
    pub fn handle_frame(&self, raw: &str) -> Inbound {
        match serde_json::from_str::<Message>(raw) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                tracing::warn!(error = %e, len = raw.len(), "Dropping malformed frame");
                Inbound::Malformed
            }
        }
    }

    /// Route an already decoded message.
    ///
    /// A message without a `timestamp` is stamped with its receipt time
    /// before any handler sees it; all other fields reach handlers as sent.
    pub fn handle_message(&self, mut message: Message) -> Inbound {
        match message.kind.as_str() {
            PONG => Inbound::Pong,
            PING => Inbound::Ping,
            _ => {
                if message.timestamp.is_empty() {
                    message.timestamp = now_timestamp();
                }
                let invoked = self.registry.dispatch(&message);
                tracing::trace!(kind = %message.kind, invoked, "Dispatched message");
                Inbound::Dispatched(invoked)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WILDCARD;
    use serde_json::json;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    fn counting(registry: &Registry, kind: &str) -> (Arc<AtomicUsize>, crate::Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = registry.subscribe(kind, move |_: &Message| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[test]
    fn test_pong_reaches_nobody() {
        let registry = Registry::new();
        let (wild, _w) = counting(&registry, WILDCARD);
        let (typed, _t) = counting(&registry, "pong");
        let dispatcher = Dispatcher::new(registry);

        let outcome = dispatcher
            .handle_frame(r#"{"type":"pong","payload":null,"timestamp":"2024-01-01T00:00:00Z"}"#);

        assert_eq!(outcome, Inbound::Pong);
        assert_eq!(wild.load(Ordering::SeqCst), 0);
        assert_eq!(typed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bare_pong_without_payload() {
        let registry = Registry::new();
        let (wild, _w) = counting(&registry, WILDCARD);
        let dispatcher = Dispatcher::new(registry);

        assert_eq!(dispatcher.handle_frame(r#"{"type":"pong"}"#), Inbound::Pong);
        assert_eq!(wild.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ping_is_consumed() {
        let registry = Registry::new();
        let (wild, _w) = counting(&registry, WILDCARD);
        let dispatcher = Dispatcher::new(registry);

        assert_eq!(dispatcher.handle_frame(r#"{"type":"ping"}"#), Inbound::Ping);
        assert_eq!(wild.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let registry = Registry::new();
        let (wild, _w) = counting(&registry, WILDCARD);
        let dispatcher = Dispatcher::new(registry);

        for raw in ["not json", "{\"type\":", "{\"payload\": 1}", "[1,2,3]", "{\"type\": 7}", ""] {
            assert_eq!(dispatcher.handle_frame(raw), Inbound::Malformed, "frame {raw:?}");
        }
        assert_eq!(wild.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_forwards_verbatim() {
        let registry = Registry::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let _sub = registry.subscribe("infrastructure_update", move |m: &Message| {
            *s.lock().unwrap() = Some(m.clone());
        });
        let dispatcher = Dispatcher::new(registry);

        let raw = r#"{"type":"infrastructure_update",
            "payload":{"host":"db-1","metric":"cpu","value":0.93},
            "timestamp":"2024-03-02T12:00:00.000Z"}"#;
        assert_eq!(dispatcher.handle_frame(raw), Inbound::Dispatched(1));

        let got = seen.lock().unwrap().clone().unwrap();
        assert_eq!(got.payload, json!({"host": "db-1", "metric": "cpu", "value": 0.93}));
        assert_eq!(got.timestamp, "2024-03-02T12:00:00.000Z");
    }

    #[test]
    fn test_missing_timestamp_is_stamped_on_receipt() {
        let registry = Registry::new();
        let seen = Arc::new(Mutex::new(String::new()));
        let s = Arc::clone(&seen);
        let _sub = registry.subscribe(WILDCARD, move |m: &Message| {
            s.lock().unwrap().clone_from(&m.timestamp);
        });
        let dispatcher = Dispatcher::new(registry);

        dispatcher.handle_frame(r#"{"type":"git_activity","payload":{"repository":"web"}}"#);
        assert!(!seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_subscribers_is_not_an_error() {
        let dispatcher = Dispatcher::default();
        assert_eq!(
            dispatcher.handle_frame(r#"{"type":"pipeline_update","payload":{}}"#),
            Inbound::Dispatched(0)
        );
    }
}
