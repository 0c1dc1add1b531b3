//! Viewing heartbeats with foreground/background coupling.
//!
//! While a consumer is viewing an item, the server must be told periodically
//! or it expires the presence entry. The scheduler owns that timer:
//!
//! ```text
//! view_item(id) ──► immediate heartbeat ──► timer @ interval
//!        │                                      │
//!        │            background ──► timer disarmed
//!        │            foreground ──► immediate heartbeat + timer re-armed
//!        ▼
//! stop_viewing() ──► timer disarmed + one stop-viewing notification
//! ```
//!
//! Every send is fire-and-forget: [`PresenceSender`] methods return nothing,
//! and network failures are swallowed — presence is advisory, not
//! correctness-critical. A send is skipped outright when no target is set or
//! the app is backgrounded at send time, which also covers the race between
//! a timer tick and a visibility change.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::ConnectionStats;

// ─── Visibility signal ──────────────────────────────────────────────

/// Foreground/background signal source.
///
/// The browser glue implements this over the page visibility API; tests and
/// headless embedders use [`ManualVisibility`].
pub trait VisibilitySignal: Send + Sync {
    fn is_foreground(&self) -> bool;
    /// Change notifications; the current value is observable via the
    /// receiver's `borrow`.
    fn watch(&self) -> watch::Receiver<bool>;
}

/// A signal that never leaves the foreground (headless embedders).
pub struct AlwaysForeground {
    tx: watch::Sender<bool>,
}

impl AlwaysForeground {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(true).0,
        }
    }
}

impl Default for AlwaysForeground {
    fn default() -> Self {
        Self::new()
    }
}

impl VisibilitySignal for AlwaysForeground {
    fn is_foreground(&self) -> bool {
        true
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// A programmatically driven signal.
pub struct ManualVisibility {
    tx: watch::Sender<bool>,
}

impl ManualVisibility {
    pub fn new(foreground: bool) -> Self {
        Self {
            tx: watch::channel(foreground).0,
        }
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.tx.send_replace(foreground);
    }
}

impl VisibilitySignal for ManualVisibility {
    fn is_foreground(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

// ─── Presence write endpoints ───────────────────────────────────────

/// Outbound presence notifications.
///
/// Both methods are fire-and-forget by contract: they return nothing, must
/// not block, and must swallow failures.
pub trait PresenceSender: Send + Sync {
    fn send_heartbeat(&self, item_id: u64);
    fn send_stop(&self, item_id: u64);
}

/// HTTP implementation: POST to `<base>/<item_id>`, status and body ignored.
pub struct HttpPresenceSender {
    client: reqwest::Client,
    heartbeat_url: String,
    stop_viewing_url: String,
}

impl HttpPresenceSender {
    pub fn new(heartbeat_url: impl Into<String>, stop_viewing_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            heartbeat_url: heartbeat_url.into(),
            stop_viewing_url: stop_viewing_url.into(),
        }
    }
}

impl PresenceSender for HttpPresenceSender {
    fn send_heartbeat(&self, item_id: u64) {
        post_and_forget(self.client.clone(), item_url(&self.heartbeat_url, item_id));
    }

    fn send_stop(&self, item_id: u64) {
        post_and_forget(self.client.clone(), item_url(&self.stop_viewing_url, item_id));
    }
}

fn item_url(base: &str, item_id: u64) -> String {
    format!("{}/{item_id}", base.trim_end_matches('/'))
}

fn post_and_forget(client: reqwest::Client, url: String) {
    tokio::spawn(async move {
        if let Err(e) = client.post(&url).send().await {
            log::debug!("presence notify to {url} failed: {e}");
        }
    });
}

// ─── Scheduler ──────────────────────────────────────────────────────

/// Keeps server-side "viewing" presence alive for at most one item at a time.
///
/// Invariant: the timer is armed iff a viewing target is set AND the app is
/// foregrounded.
#[derive(Clone)]
pub struct HeartbeatScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    interval: Duration,
    sender: Arc<dyn PresenceSender>,
    visibility: Arc<dyn VisibilitySignal>,
    stats: Arc<ConnectionStats>,
    viewing: Mutex<Option<u64>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerInner {
    /// One guarded send: no-op without a target or while backgrounded.
    fn send_heartbeat_now(&self) {
        let Some(item_id) = *self.viewing.lock() else {
            return;
        };
        if !self.visibility.is_foreground() {
            return;
        }
        self.sender.send_heartbeat(item_id);
        self.stats.record_heartbeat();
    }

    fn disarm_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    fn disarm_watcher(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

impl HeartbeatScheduler {
    pub fn new(
        interval: Duration,
        sender: Arc<dyn PresenceSender>,
        visibility: Arc<dyn VisibilitySignal>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                interval,
                sender,
                visibility,
                stats,
                viewing: Mutex::new(None),
                timer: Mutex::new(None),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Start (or switch) viewing: one immediate heartbeat, then the
    /// recurring timer while foregrounded.
    pub fn view_item(&self, item_id: u64) {
        *self.inner.viewing.lock() = Some(item_id);
        self.inner.send_heartbeat_now();
        arm_timer(&self.inner);
        arm_watcher(&self.inner);
    }

    /// Stop viewing. Sends one stop-viewing notification only if a target
    /// was actually set; with no prior `view_item` this is a pure no-op.
    pub fn stop_viewing(&self) {
        self.inner.disarm_timer();
        self.inner.disarm_watcher();
        let previous = self.inner.viewing.lock().take();
        if let Some(item_id) = previous {
            self.inner.sender.send_stop(item_id);
        }
    }

    /// Current viewing target, if any.
    pub fn viewing(&self) -> Option<u64> {
        *self.inner.viewing.lock()
    }

    /// Re-announce presence after a reconnect; the server is not assumed to
    /// have kept it across the gap.
    pub(crate) fn resend_if_viewing(&self) {
        self.inner.send_heartbeat_now();
    }

    /// Silent teardown on intentional disconnect: no stop-viewing call.
    pub(crate) fn teardown(&self) {
        self.inner.disarm_timer();
        self.inner.disarm_watcher();
        *self.inner.viewing.lock() = None;
    }
}

fn arm_timer(inner: &Arc<SchedulerInner>) {
    let mut slot = inner.timer.lock();
    if let Some(handle) = slot.take() {
        handle.abort();
    }
    if !inner.visibility.is_foreground() {
        return;
    }
    let task_inner = inner.clone();
    *slot = Some(tokio::spawn(async move {
        // The immediate heartbeat already went out; first tick is one full
        // interval away.
        let start = tokio::time::Instant::now() + task_inner.interval;
        let mut ticker = tokio::time::interval_at(start, task_inner.interval);
        loop {
            ticker.tick().await;
            task_inner.send_heartbeat_now();
        }
    }));
}

fn arm_watcher(inner: &Arc<SchedulerInner>) {
    let mut slot = inner.watcher.lock();
    if slot.is_some() {
        return;
    }
    let task_inner = inner.clone();
    *slot = Some(tokio::spawn(async move {
        let mut rx = task_inner.visibility.watch();
        rx.mark_unchanged();
        while rx.changed().await.is_ok() {
            let foreground = *rx.borrow_and_update();
            if foreground {
                if task_inner.viewing.lock().is_some() {
                    // Absence must not be misreported after the pause.
                    task_inner.send_heartbeat_now();
                    arm_timer(&task_inner);
                }
            } else {
                task_inner.disarm_timer();
            }
        }
    }));
}

// ===================================================================
// Tests
// ===================================================================
