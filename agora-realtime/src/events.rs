//! Typed event bus with disposable subscriptions.
//!
//! Events fall into two groups: synthetic connection-status events emitted by
//! the manager itself, and decoded push frames keyed by their wire type
//! string. Handlers register for one [`EventKind`] or for all events; within
//! one dispatch, exact-kind handlers run before all-events handlers, each in
//! registration order.
//!
//! Dispatch iterates a snapshot of the registry and re-checks each entry's
//! active flag immediately before invoking it, so a handler may unsubscribe
//! itself (or any other handler) mid-dispatch: the removed handler is skipped
//! for the rest of the pass and never sees another event. Handler panics are
//! caught and logged so one bad subscriber cannot break dispatch to the rest.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

/// An event delivered to subscribers.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    /// The push connection opened (initially or after a reconnect).
    Open,
    /// A transport-level error occurred; the connection may close next.
    Error { detail: String },
    /// The push connection closed without an intentional disconnect.
    Closed,
    /// Reconnection attempts are exhausted; terminal for this session.
    Failed,
    /// A decoded push frame.
    Frame { event_type: String, payload: Value },
}

impl RealtimeEvent {
    /// The registry key this event dispatches under.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Error { .. } => EventKind::Error,
            Self::Closed => EventKind::Closed,
            Self::Failed => EventKind::Failed,
            Self::Frame { event_type, .. } => EventKind::Frame(event_type.clone()),
        }
    }

    /// Wire-style name, for logging.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Open => "connection.open",
            Self::Error { .. } => "connection.error",
            Self::Closed => "connection.closed",
            Self::Failed => "connection.failed",
            Self::Frame { event_type, .. } => event_type,
        }
    }
}

/// Registry key: one synthetic status kind or one frame type string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Error,
    Closed,
    Failed,
    Frame(String),
}

type HandlerFn = dyn Fn(&RealtimeEvent) + Send + Sync;

#[derive(Clone)]
struct HandlerEntry {
    id: Uuid,
    active: Arc<AtomicBool>,
    handler: Arc<HandlerFn>,
}

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, Vec<HandlerEntry>>,
    any: Vec<HandlerEntry>,
}

/// The subscriber registry shared by one connection manager.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let entry = HandlerEntry {
            id: Uuid::new_v4(),
            active: Arc::new(AtomicBool::new(true)),
            handler: Arc::new(handler),
        };
        let subscription = Subscription {
            id: entry.id,
            active: entry.active.clone(),
            registry: Arc::downgrade(&self.registry),
            kind: Some(kind.clone()),
        };
        self.registry.write().by_kind.entry(kind).or_default().push(entry);
        subscription
    }

    /// Register a handler for every event, including unknown frame types.
    pub fn on_any(
        &self,
        handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let entry = HandlerEntry {
            id: Uuid::new_v4(),
            active: Arc::new(AtomicBool::new(true)),
            handler: Arc::new(handler),
        };
        let subscription = Subscription {
            id: entry.id,
            active: entry.active.clone(),
            registry: Arc::downgrade(&self.registry),
            kind: None,
        };
        self.registry.write().any.push(entry);
        subscription
    }

    /// Deliver one event: exact-kind handlers first, then all-events
    /// handlers, in registration order.
    ///
    /// No lock is held while handlers run, so handlers may freely register,
    /// unsubscribe, or drive the manager.
    pub fn dispatch(&self, event: &RealtimeEvent) {
        let snapshot: Vec<HandlerEntry> = {
            let registry = self.registry.read();
            let mut entries = Vec::new();
            if let Some(list) = registry.by_kind.get(&event.kind()) {
                entries.extend(list.iter().cloned());
            }
            entries.extend(registry.any.iter().cloned());
            entries
        };

        for entry in snapshot {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.handler)(event)));
            if outcome.is_err() {
                log::warn!("event handler panicked during {} dispatch", event.type_name());
            }
        }
    }

    /// Number of registered handlers (exact-kind plus all-events).
    pub fn handler_count(&self) -> usize {
        let registry = self.registry.read();
        registry.by_kind.values().map(Vec::len).sum::<usize>() + registry.any.len()
    }
}

/// Disposable handle for one registration.
///
/// Calling [`Subscription::unsubscribe`] removes exactly that registration;
/// repeat calls are no-ops. Dropping the handle without calling it leaves the
/// handler registered for the life of the bus.
pub struct Subscription {
    id: Uuid,
    active: Arc<AtomicBool>,
    registry: Weak<RwLock<Registry>>,
    /// `None` for all-events registrations.
    kind: Option<EventKind>,
}

impl Subscription {
    /// Remove this registration. Idempotent; safe to call from within the
    /// handler's own invocation.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.write();
        match &self.kind {
            Some(kind) => {
                if let Some(list) = registry.by_kind.get_mut(kind) {
                    list.retain(|entry| entry.id != self.id);
                    if list.is_empty() {
                        registry.by_kind.remove(kind);
                    }
                }
            }
            None => registry.any.retain(|entry| entry.id != self.id),
        }
    }

    /// Whether the registration is still live.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

// ===================================================================
// Tests
// ===================================================================
