//! Subscriber registry: routes messages to handlers by message type.

use std::{
    any::Any,
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    message::{Message, WILDCARD},
    payload::Payload,
};

/// Callback invoked for every matching message.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

struct Entry {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    handlers: HashMap<String, Vec<Entry>>,
}

#[derive(Default)]
struct Shared {
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Handlers never run under the lock, so a poisoned guard still holds
        // a consistent map.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, kind: &str, id: u64) {
        let mut inner = self.lock();
        if let Some(entries) = inner.handlers.get_mut(kind) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                inner.handlers.remove(kind);
            }
        }
    }
}

/// Maps message types to independent handlers.
///
/// Cloning is cheap and every clone shares the same handler table.
/// `subscribe` and unsubscribing are safe from inside a handler: dispatch
/// works on a snapshot taken before the first handler runs.
#[derive(Clone, Default)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for messages of type `kind` (`"*"` for all).
    ///
    /// Registering the same closure twice registers two handlers, and each
    /// is invoked once per message.
    pub fn subscribe<F>(&self, kind: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let kind = kind.into();
        let active = Arc::new(AtomicBool::new(true));

        let mut inner = self.shared.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handlers.entry(kind.clone()).or_default().push(Entry {
            id,
            active: Arc::clone(&active),
            handler: Arc::new(handler),
        });
        drop(inner);

        tracing::trace!(kind = %kind, id, "Handler subscribed");

        Subscription {
            registry: Arc::downgrade(&self.shared),
            kind,
            id,
            active,
            detached: false,
        }
    }

    /// Register a handler that receives the decoded payload of `P::TYPE`.
    ///
    /// Messages whose payload does not decode into `P` are logged and
    /// skipped for this handler only.
    pub fn subscribe_typed<P, F>(&self, handler: F) -> Subscription
    where
        P: Payload,
        F: Fn(P) + Send + Sync + 'static,
    {
        self.subscribe(P::TYPE, move |message: &Message| {
            match message.decode_payload::<P>() {
                Ok(payload) => handler(payload),
                Err(e) => {
                    tracing::warn!(
                        kind = P::TYPE,
                        error = %e,
                        "Skipping payload with unexpected shape"
                    );
                }
            }
        })
    }

    /// Deliver `message` to its type's handlers, then to wildcard handlers.
    ///
    /// Handlers run in registration order. A panicking handler is logged
    /// and the remaining handlers still run. Returns how many handlers were
    /// invoked.
    pub fn dispatch(&self, message: &Message) -> usize {
        let snapshot: Vec<(Arc<AtomicBool>, Handler)> = {
            let inner = self.shared.lock();
            let typed = inner.handlers.get(&message.kind).into_iter().flatten();
            let wildcard = if message.kind == WILDCARD {
                None
            } else {
                inner.handlers.get(WILDCARD)
            };
            typed
                .chain(wildcard.into_iter().flatten())
                .map(|e| (Arc::clone(&e.active), Arc::clone(&e.handler)))
                .collect()
        };

        let mut invoked = 0;
        for (active, handler) in snapshot {
            // Skip handlers unsubscribed by an earlier handler of this dispatch.
            if !active.load(Ordering::Acquire) {
                continue;
            }
            invoked += 1;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(message))) {
                tracing::error!(
                    kind = %message.kind,
                    reason = panic_reason(panic.as_ref()),
                    "Message handler panicked"
                );
            }
        }
        invoked
    }

    /// Number of handlers registered for exactly `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: &str) -> usize {
        self.shared.lock().handlers.get(kind).map_or(0, Vec::len)
    }

    /// Whether any handler table entry exists for `kind`.
    #[must_use]
    pub fn has_type(&self, kind: &str) -> bool {
        self.shared.lock().handlers.contains_key(kind)
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Handle for one registered handler.
///
/// Dropping it unsubscribes the handler; call [`Subscription::detach`] to
/// keep the handler for as long as the registry lives.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    registry: Weak<Shared>,
    kind: String,
    id: u64,
    active: Arc<AtomicBool>,
    detached: bool,
}

impl Subscription {
    /// Message type this subscription listens to.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Whether the handler is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the handler. It is never invoked again, even by a dispatch
    /// that is already in progress.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the handler registered without holding on to this handle.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        self.active.store(false, Ordering::Release);
        if let Some(shared) = self.registry.upgrade() {
            shared.remove(&self.kind, self.id);
            tracing::trace!(kind = %self.kind, id = self.id, "Handler unsubscribed");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PipelineUpdate;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Message) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &Message| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl Fn(&Message) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |_: &Message| log.lock().unwrap().push(name)
    }

    #[test]
    fn test_routes_by_type() {
        let registry = Registry::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&received);
        let _a = registry.subscribe("pipeline_update", move |m: &Message| {
            r.lock().unwrap().push(m.payload.clone());
        });
        let (b_count, b) = counter();
        let _b = registry.subscribe("other_type", b);

        let payload = json!({"stage": "build", "status": "running"});
        let invoked = registry.dispatch(&Message::new("pipeline_update", payload.clone()));

        assert_eq!(invoked, 1);
        assert_eq!(*received.lock().unwrap(), vec![payload]);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_type_handlers_before_wildcard_in_registration_order() {
        let registry = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _w = registry.subscribe(WILDCARD, recorder(&log, "wildcard"));
        let _a = registry.subscribe("git_activity", recorder(&log, "a"));
        let _b = registry.subscribe("git_activity", recorder(&log, "b"));

        assert_eq!(registry.dispatch(&Message::new("git_activity", json!({}))), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "wildcard"]);
    }

    #[test]
    fn test_same_handler_twice_runs_twice() {
        let registry = Registry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handler: Handler = {
            let c = Arc::clone(&count);
            Arc::new(move |_: &Message| {
                c.fetch_add(1, Ordering::SeqCst);
            })
        };
        let h1 = Arc::clone(&handler);
        let h2 = Arc::clone(&handler);
        let _s1 = registry.subscribe("x", move |m: &Message| h1(m));
        let _s2 = registry.subscribe("x", move |m: &Message| h2(m));

        registry.dispatch(&Message::new("x", json!(null)));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let registry = Registry::new();
        let (before, h_before) = counter();
        let (after, h_after) = counter();
        let _a = registry.subscribe("x", h_before);
        let _b = registry.subscribe("x", |_: &Message| panic!("handler failure"));
        let _c = registry.subscribe("x", h_after);

        assert_eq!(registry.dispatch(&Message::new("x", json!(null))), 3);
        assert_eq!(registry.dispatch(&Message::new("x", json!(null))), 3);
        assert_eq!(before.load(Ordering::SeqCst), 2);
        assert_eq!(after.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_prunes_type() {
        let registry = Registry::new();
        let (count, handler) = counter();
        let sub = registry.subscribe("x", handler);
        assert!(registry.has_type("x"));

        sub.unsubscribe();
        assert!(!registry.has_type("x"));
        assert_eq!(registry.dispatch(&Message::new("x", json!(null))), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_many_cycles_do_not_leak_entries() {
        let registry = Registry::new();
        for i in 0..1_000 {
            let kind = format!("type-{}", i % 7);
            let (_, handler) = counter();
            registry.subscribe(kind, handler).unsubscribe();
        }
        for i in 0..7 {
            assert!(!registry.has_type(&format!("type-{i}")));
        }
    }

    #[test]
    fn test_detach_keeps_handler() {
        let registry = Registry::new();
        let (count, handler) = counter();
        registry.subscribe("x", handler).detach();

        registry.dispatch(&Message::new("x", json!(null)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handler_count("x"), 1);
    }

    #[test]
    fn test_handler_can_unsubscribe_itself_mid_dispatch() {
        let registry = Registry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let (count, _) = counter();

        let s = Arc::clone(&slot);
        let c = Arc::clone(&count);
        let sub = registry.subscribe("x", move |_: &Message| {
            c.fetch_add(1, Ordering::SeqCst);
            drop(s.lock().unwrap().take());
        });
        *slot.lock().unwrap() = Some(sub);

        registry.dispatch(&Message::new("x", json!(null)));
        registry.dispatch(&Message::new("x", json!(null)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!registry.has_type("x"));
    }

    #[test]
    fn test_unsubscribed_mid_dispatch_is_not_invoked() {
        let registry = Registry::new();
        let victim_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&victim_slot);
        let _killer = registry.subscribe("x", move |_: &Message| {
            drop(slot.lock().unwrap().take());
        });
        let (victim_count, victim) = counter();
        *victim_slot.lock().unwrap() = Some(registry.subscribe("x", victim));

        assert_eq!(registry.dispatch(&Message::new("x", json!(null))), 1);
        assert_eq!(victim_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscribe_mid_dispatch_starts_with_next_message() {
        let registry = Registry::new();
        let late_count = Arc::new(AtomicUsize::new(0));
        let late_subs = Arc::new(Mutex::new(Vec::new()));

        let reg = registry.clone();
        let lc = Arc::clone(&late_count);
        let subs = Arc::clone(&late_subs);
        let _spawner = registry.subscribe("x", move |_: &Message| {
            let lc = Arc::clone(&lc);
            let sub = reg.subscribe("x", move |_: &Message| {
                lc.fetch_add(1, Ordering::SeqCst);
            });
            subs.lock().unwrap().push(sub);
        });

        assert_eq!(registry.dispatch(&Message::new("x", json!(null))), 1);
        assert_eq!(late_count.load(Ordering::SeqCst), 0);

        // Second dispatch: spawner plus the one late handler from round one.
        assert_eq!(registry.dispatch(&Message::new("x", json!(null))), 2);
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_typed_decodes_and_skips_bad_shapes() {
        let registry = Registry::new();
        let stages = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&stages);
        let _sub = registry.subscribe_typed::<PipelineUpdate, _>(move |u| {
            s.lock().unwrap().push(u.stage);
        });

        registry.dispatch(&Message::new("pipeline_update", json!({"stage": "deploy"})));
        registry.dispatch(&Message::new("pipeline_update", json!({"nope": 1})));

        assert_eq!(*stages.lock().unwrap(), vec!["deploy".to_string()]);
    }

    #[test]
    fn test_dropping_registry_first_is_harmless() {
        let registry = Registry::new();
        let (_, handler) = counter();
        let sub = registry.subscribe("x", handler);
        drop(registry);
        assert!(sub.is_active());
        sub.unsubscribe();
    }
}
