//! Reconnecting push-stream connection manager.
//!
//! One manager wraps one push endpoint and is shared by every logical
//! consumer of that endpoint:
//!
//! ```text
//! consumer A ──┐
//!              ├── ConnectionManager ── PushSocket (one at a time)
//! consumer B ──┘        │
//!                       ├── EventBus (typed dispatch)
//!                       ├── HeartbeatScheduler
//!                       └── backoff reconnect loop
//! ```
//!
//! Consumers share the socket through reference counting: the socket opens
//! on the first `connect()` and the teardown happens only when the last
//! consumer calls `disconnect()`. In between, transport failures drive a
//! bounded exponential backoff loop — they are surfaced as status events,
//! never as errors across the public API.
//!
//! State machine:
//! `Idle → Connecting → Open → Closed → Connecting … → Failed (terminal)`,
//! with `disconnect()` to refcount 0 short-circuiting to `Closed` from any
//! state, with no retry.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::{EventBus, EventKind, RealtimeEvent, Subscription};
use crate::heartbeat::{HeartbeatScheduler, PresenceSender, VisibilitySignal};
use crate::protocol::Envelope;
use crate::transport::PushTransport;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

/// Tunables for one manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// First reconnect delay; doubles per failed attempt.
    pub base_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
    /// Viewing heartbeat period.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(n-1)`,
/// capped at `max_delay`.
pub(crate) fn reconnect_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    config
        .base_delay
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(config.max_delay)
}

// ─── Stats ──────────────────────────────────────────────────────────

/// Lock-free counters for monitoring connection health.
#[derive(Default)]
pub struct ConnectionStats {
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    events_dispatched: AtomicU64,
    reconnect_attempts: AtomicU64,
    heartbeats_sent: AtomicU64,
}

impl ConnectionStats {
    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub events_dispatched: u64,
    pub reconnect_attempts: u64,
    pub heartbeats_sent: u64,
}

// ─── Manager ────────────────────────────────────────────────────────

/// Shared, refcounted handle to one push endpoint.
///
/// Cheap to clone; all clones drive the same underlying connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    url: String,
    config: ConnectionConfig,
    transport: Arc<dyn PushTransport>,
    bus: EventBus,
    heartbeat: HeartbeatScheduler,
    stats: Arc<ConnectionStats>,
    state: RwLock<ConnectionState>,
    refcount: AtomicU32,
    intentional: AtomicBool,
    /// Session generation; a winding-down task must not stomp the state of
    /// the session that superseded it.
    generation: AtomicU64,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagerInner {
    fn set_state_for(&self, session: u64, state: ConnectionState) {
        if self.generation.load(Ordering::SeqCst) == session {
            *self.state.write() = state;
        }
    }

    fn dispatch(&self, event: &RealtimeEvent) {
        self.bus.dispatch(event);
        self.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_frame(&self, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        match Envelope::decode(text) {
            Ok(envelope) => self.dispatch(&RealtimeEvent::Frame {
                event_type: envelope.event_type,
                payload: envelope.payload,
            }),
            Err(e) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("dropping malformed frame from {}: {e}", self.url);
            }
        }
    }
}

impl ConnectionManager {
    pub fn new(
        url: impl Into<String>,
        config: ConnectionConfig,
        transport: Arc<dyn PushTransport>,
        sender: Arc<dyn PresenceSender>,
        visibility: Arc<dyn VisibilitySignal>,
    ) -> Self {
        let stats = Arc::new(ConnectionStats::default());
        let heartbeat = HeartbeatScheduler::new(
            config.heartbeat_interval,
            sender,
            visibility,
            stats.clone(),
        );
        Self {
            inner: Arc::new(ManagerInner {
                url: url.into(),
                config,
                transport,
                bus: EventBus::new(),
                heartbeat,
                stats,
                state: RwLock::new(ConnectionState::Idle),
                refcount: AtomicU32::new(0),
                intentional: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                shutdown: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Register this caller as a consumer. The socket opens on the 0→1
    /// transition; later calls only bump the count.
    pub fn connect(&self) {
        let previous = self.inner.refcount.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            self.start_session();
        }
    }

    /// Release one consumer reference (floor 0). When the count reaches
    /// zero the close is intentional: the socket and any active heartbeat
    /// are torn down and no reconnect is scheduled.
    pub fn disconnect(&self) {
        let result = self
            .inner
            .refcount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if result == Ok(1) {
            self.teardown();
        }
    }

    /// Force-release every consumer (application teardown).
    pub fn shutdown(&self) {
        self.inner.refcount.swap(0, Ordering::SeqCst);
        self.teardown();
    }

    fn start_session(&self) {
        let mut task = self.inner.task.lock();
        if let Some(handle) = task.take() {
            // Keep a live session; replace one that was told to exit.
            if !handle.is_finished() && !self.inner.intentional.load(Ordering::SeqCst) {
                *task = Some(handle);
                return;
            }
        }
        self.inner.intentional.store(false, Ordering::SeqCst);
        let session = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_state_for(session, ConnectionState::Idle);
        let (tx, rx) = watch::channel(false);
        *self.inner.shutdown.lock() = Some(tx);
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(connection_task(inner, session, rx)));
    }

    fn teardown(&self) {
        self.inner.intentional.store(true, Ordering::SeqCst);
        self.inner.heartbeat.teardown();
        if let Some(tx) = self.inner.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        // Detach rather than abort: the task observes the signal and closes
        // the socket cleanly.
        let _ = self.inner.task.lock().take();
    }

    /// Register a handler for one event kind.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.bus.on(kind, handler)
    }

    /// Register a handler for a frame type by its wire name.
    pub fn on_frame(
        &self,
        event_type: &str,
        handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.bus.on(EventKind::Frame(event_type.to_owned()), handler)
    }

    /// Register a handler for every event.
    pub fn on_any(
        &self,
        handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.bus.on_any(handler)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Active consumer count.
    pub fn refcount(&self) -> u32 {
        self.inner.refcount.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Start sending viewing heartbeats for `item_id`.
    pub fn view_item(&self, item_id: u64) {
        self.inner.heartbeat.view_item(item_id);
    }

    /// Stop sending viewing heartbeats and notify the server once.
    pub fn stop_viewing(&self) {
        self.inner.heartbeat.stop_viewing();
    }

    /// Current viewing target, if any.
    pub fn viewing(&self) -> Option<u64> {
        self.inner.heartbeat.viewing()
    }

    /// Inject an event as if it had been decoded off the wire.
    #[cfg(test)]
    pub(crate) fn dispatch_event(&self, event: &RealtimeEvent) {
        self.inner.dispatch(event);
    }
}

// ─── Connection task ────────────────────────────────────────────────

/// Owns the socket for one session: open, read, backoff, repeat.
///
/// Exits on the shutdown signal (intentional close, no `connection.closed`
/// emitted) or after the retry budget is exhausted (one terminal
/// `connection.failed`).
async fn connection_task(
    inner: Arc<ManagerInner>,
    session: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        inner.set_state_for(session, ConnectionState::Connecting);
        let opened = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => {
                inner.set_state_for(session, ConnectionState::Closed);
                return;
            }
            opened = inner.transport.open(&inner.url) => opened,
        };

        match opened {
            Ok(mut socket) => {
                attempt = 0;
                inner.set_state_for(session, ConnectionState::Open);
                log::info!("push stream open: {}", inner.url);
                inner.dispatch(&RealtimeEvent::Open);
                inner.heartbeat.resend_if_viewing();

                let mut transport_error: Option<String> = None;
                loop {
                    // The `select!` output owns the non-`Send` watch guard for
                    // the duration of a branch body, so the shutdown branch only
                    // signals here and the (awaited) close happens after the
                    // guard has been dropped.
                    let shutting_down = tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|stop| *stop) => true,
                        frame = socket.next_frame() => match frame {
                            Some(Ok(text)) => {
                                inner.handle_frame(&text);
                                false
                            }
                            Some(Err(e)) => {
                                transport_error = Some(e.to_string());
                                break;
                            }
                            None => break,
                        }
                    };
                    if shutting_down {
                        socket.close().await;
                        inner.set_state_for(session, ConnectionState::Closed);
                        return;
                    }
                }

                if let Some(detail) = transport_error {
                    log::warn!("push stream error on {}: {detail}", inner.url);
                    inner.dispatch(&RealtimeEvent::Error { detail });
                }
                inner.set_state_for(session, ConnectionState::Closed);
                inner.dispatch(&RealtimeEvent::Closed);
            }
            Err(e) => {
                log::warn!("push stream connect to {} failed: {e}", inner.url);
                inner.dispatch(&RealtimeEvent::Error { detail: e.to_string() });
                inner.set_state_for(session, ConnectionState::Closed);
                inner.dispatch(&RealtimeEvent::Closed);
            }
        }

        attempt += 1;
        inner.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt > inner.config.max_attempts {
            log::warn!(
                "giving up on {} after {} reconnect attempts",
                inner.url,
                inner.config.max_attempts
            );
            inner.set_state_for(session, ConnectionState::Failed);
            inner.dispatch(&RealtimeEvent::Failed);
            return;
        }

        let delay = reconnect_delay(&inner.config, attempt);
        log::info!(
            "reconnecting to {} in {:?} (attempt {attempt})",
            inner.url,
            delay
        );
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => {
                inner.set_state_for(session, ConnectionState::Closed);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ===================================================================
// Tests
// ===================================================================
