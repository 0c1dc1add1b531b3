//! Per-item viewer presence for one domain.
//!
//! Translates the raw event stream into a consumable "who is viewing what"
//! view, decoupling callers from the per-domain payload field names
//! (`postId` vs `reportId`):
//!
//! ```text
//! initial snapshot ──► PresenceMap ◄── <domain>.viewer_joined / viewer_left
//!                          │
//!                          ▼
//!                 viewers(item_id) → [Viewer, …]   (insertion order)
//! ```
//!
//! The map is seeded once from the page-load snapshot and then mutated only
//! by join/leave events. A viewer who drops out without a leave event stays
//! listed until one arrives; the map is deliberately not cleared on
//! reconnect (the heartbeat re-announce repopulates server state, and leave
//! events remain the only pruning mechanism).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::ConnectionManager;
use crate::events::{EventKind, RealtimeEvent, Subscription};
use crate::protocol::{self, ItemPresence, PresenceChange, Viewer};
use crate::registry::DomainConfig;

type PresenceMap = Arc<RwLock<HashMap<u64, Vec<Viewer>>>>;

/// Consumer-facing presence view over one shared connection.
///
/// Construction registers this aggregator as one consumer of the manager
/// (`connect()`); [`PresenceAggregator::close`] — or drop — releases it.
pub struct PresenceAggregator {
    manager: ConnectionManager,
    map: PresenceMap,
    connected: Arc<AtomicBool>,
    subscriptions: Vec<Subscription>,
    released: AtomicBool,
}

impl PresenceAggregator {
    /// Build the starting map from an optional snapshot and start listening.
    pub fn new(
        manager: ConnectionManager,
        domain: &DomainConfig,
        snapshot: Option<Vec<ItemPresence>>,
    ) -> Self {
        let map: PresenceMap = Arc::new(RwLock::new(build_map(snapshot.unwrap_or_default())));
        let connected = Arc::new(AtomicBool::new(false));
        let mut subscriptions = Vec::with_capacity(4);

        let joined_type = format!("{}.viewer_joined", domain.name);
        let left_type = format!("{}.viewer_left", domain.name);

        {
            let map = map.clone();
            let field = domain.item_id_field.clone();
            subscriptions.push(manager.on_frame(&joined_type, move |event| {
                if let RealtimeEvent::Frame { payload, .. } = event {
                    match protocol::parse_presence_payload(payload, &field) {
                        Ok(change) => apply_joined(&map, change),
                        Err(e) => log::debug!("ignoring viewer_joined payload: {e}"),
                    }
                }
            }));
        }
        {
            let map = map.clone();
            let field = domain.item_id_field.clone();
            subscriptions.push(manager.on_frame(&left_type, move |event| {
                if let RealtimeEvent::Frame { payload, .. } = event {
                    match protocol::parse_presence_payload(payload, &field) {
                        Ok(change) => apply_left(&map, &change),
                        Err(e) => log::debug!("ignoring viewer_left payload: {e}"),
                    }
                }
            }));
        }
        {
            let connected = connected.clone();
            subscriptions.push(manager.on(EventKind::Open, move |_| {
                connected.store(true, Ordering::Release);
            }));
        }
        {
            let connected = connected.clone();
            subscriptions.push(manager.on(EventKind::Closed, move |_| {
                connected.store(false, Ordering::Release);
            }));
        }

        manager.connect();
        // Seed after subscribing so a connection that is already open is
        // not reported as down to this late consumer.
        connected.store(manager.is_connected(), Ordering::Release);

        Self {
            manager,
            map,
            connected,
            subscriptions,
            released: AtomicBool::new(false),
        }
    }

    /// Viewers currently recorded for `item_id`, in join order.
    pub fn viewers(&self, item_id: u64) -> Vec<Viewer> {
        self.map.read().get(&item_id).cloned().unwrap_or_default()
    }

    /// Number of viewers recorded for `item_id`.
    pub fn viewer_count(&self, item_id: u64) -> usize {
        self.map.read().get(&item_id).map_or(0, Vec::len)
    }

    /// Item ids that currently have at least one viewer.
    pub fn items_with_viewers(&self) -> Vec<u64> {
        self.map.read().keys().copied().collect()
    }

    /// Live connection status, seeded at construction time.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Announce that the local user is viewing `item_id`.
    pub fn view_item(&self, item_id: u64) {
        self.manager.view_item(item_id);
    }

    /// Announce that the local user stopped viewing.
    pub fn stop_viewing(&self) {
        self.manager.stop_viewing();
    }

    /// Release this consumer: unsubscribe all handlers and give back the
    /// connection reference. Idempotent; also invoked on drop.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
        self.manager.disconnect();
    }
}

impl Drop for PresenceAggregator {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_map(snapshot: Vec<ItemPresence>) -> HashMap<u64, Vec<Viewer>> {
    let mut map = HashMap::new();
    for entry in snapshot {
        if entry.viewers.is_empty() {
            continue;
        }
        let mut viewers: Vec<Viewer> = Vec::with_capacity(entry.viewers.len());
        for viewer in entry.viewers {
            if !viewers.iter().any(|v| v.user_id == viewer.user_id) {
                viewers.push(viewer);
            }
        }
        map.insert(entry.item_id, viewers);
    }
    map
}

fn apply_joined(map: &PresenceMap, change: PresenceChange) {
    let mut map = map.write();
    let viewers = map.entry(change.item_id).or_default();
    if viewers.iter().any(|v| v.user_id == change.viewer.user_id) {
        return;
    }
    viewers.push(change.viewer);
}

fn apply_left(map: &PresenceMap, change: &PresenceChange) {
    let mut map = map.write();
    if let Some(viewers) = map.get_mut(&change.item_id) {
        viewers.retain(|v| v.user_id != change.viewer.user_id);
        if viewers.is_empty() {
            map.remove(&change.item_id);
        }
    }
}

// ===================================================================
// Tests
// ===================================================================
