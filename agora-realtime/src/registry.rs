//! Application-level registry of per-domain realtime managers.
//!
//! The moderation console talks to two independent push domains — the
//! review queue and the report inbox. Both are the same machinery
//! parameterized by endpoint URLs and the payload field carrying the item
//! id. The registry constructs one [`ConnectionManager`] per domain up
//! front and hands out [`PresenceAggregator`]s on demand; nothing here is a
//! module-level singleton, so tests build their own registry with injected
//! transports and tear it down deterministically.

use std::sync::Arc;

use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::heartbeat::{AlwaysForeground, HttpPresenceSender, VisibilitySignal};
use crate::presence::PresenceAggregator;
use crate::protocol::ItemPresence;
use crate::transport::{PushTransport, WebSocketTransport};

/// Endpoints and payload conventions for one push domain.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Event-type prefix: `<name>.viewer_joined`, `<name>.viewer_left`.
    pub name: String,
    pub stream_url: String,
    pub heartbeat_url: String,
    pub stop_viewing_url: String,
    /// Payload field carrying the item id for this domain.
    pub item_id_field: String,
}

impl DomainConfig {
    /// Review-queue domain rooted at the given bases.
    pub fn queue(ws_base: &str, http_base: &str) -> Self {
        Self {
            name: "queue".into(),
            stream_url: format!("{}/queue/events", ws_base.trim_end_matches('/')),
            heartbeat_url: format!("{}/queue/viewing", http_base.trim_end_matches('/')),
            stop_viewing_url: format!("{}/queue/viewing/stop", http_base.trim_end_matches('/')),
            item_id_field: "postId".into(),
        }
    }

    /// Report-inbox domain rooted at the given bases.
    pub fn reports(ws_base: &str, http_base: &str) -> Self {
        Self {
            name: "report".into(),
            stream_url: format!("{}/reports/events", ws_base.trim_end_matches('/')),
            heartbeat_url: format!("{}/reports/viewing", http_base.trim_end_matches('/')),
            stop_viewing_url: format!("{}/reports/viewing/stop", http_base.trim_end_matches('/')),
            item_id_field: "reportId".into(),
        }
    }
}

/// Full registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub connection: ConnectionConfig,
    pub queue: DomainConfig,
    pub reports: DomainConfig,
}

impl RegistryConfig {
    /// Derive both domains from a WebSocket base and an HTTP base.
    pub fn for_bases(ws_base: &str, http_base: &str) -> Self {
        Self {
            connection: ConnectionConfig::default(),
            queue: DomainConfig::queue(ws_base, http_base),
            reports: DomainConfig::reports(ws_base, http_base),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::for_bases("ws://127.0.0.1:9090", "http://127.0.0.1:8080")
    }
}

/// Owns one manager per domain for the application's lifetime.
pub struct RealtimeRegistry {
    queue: ConnectionManager,
    reports: ConnectionManager,
    queue_domain: DomainConfig,
    report_domain: DomainConfig,
}

impl RealtimeRegistry {
    /// Production wiring: WebSocket streams, HTTP presence endpoints, no
    /// backgrounding signal.
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_transport(
            config,
            Arc::new(WebSocketTransport),
            Arc::new(AlwaysForeground::new()),
        )
    }

    /// Wiring with an injected transport and visibility signal; presence
    /// notifications still go over HTTP.
    pub fn with_transport(
        config: RegistryConfig,
        transport: Arc<dyn PushTransport>,
        visibility: Arc<dyn VisibilitySignal>,
    ) -> Self {
        let queue = ConnectionManager::new(
            config.queue.stream_url.clone(),
            config.connection.clone(),
            transport.clone(),
            Arc::new(HttpPresenceSender::new(
                config.queue.heartbeat_url.clone(),
                config.queue.stop_viewing_url.clone(),
            )),
            visibility.clone(),
        );
        let reports = ConnectionManager::new(
            config.reports.stream_url.clone(),
            config.connection.clone(),
            transport,
            Arc::new(HttpPresenceSender::new(
                config.reports.heartbeat_url.clone(),
                config.reports.stop_viewing_url.clone(),
            )),
            visibility,
        );
        Self::from_managers(queue, config.queue, reports, config.reports)
    }

    /// Fully injected wiring, for tests.
    pub fn from_managers(
        queue: ConnectionManager,
        queue_domain: DomainConfig,
        reports: ConnectionManager,
        report_domain: DomainConfig,
    ) -> Self {
        Self {
            queue,
            reports,
            queue_domain,
            report_domain,
        }
    }

    /// Presence view over the review queue.
    pub fn queue_presence(&self, snapshot: Option<Vec<ItemPresence>>) -> PresenceAggregator {
        PresenceAggregator::new(self.queue.clone(), &self.queue_domain, snapshot)
    }

    /// Presence view over the report inbox.
    pub fn report_presence(&self, snapshot: Option<Vec<ItemPresence>>) -> PresenceAggregator {
        PresenceAggregator::new(self.reports.clone(), &self.report_domain, snapshot)
    }

    pub fn queue_manager(&self) -> &ConnectionManager {
        &self.queue
    }

    pub fn report_manager(&self) -> &ConnectionManager {
        &self.reports
    }

    /// Application teardown: force-close both domains.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        self.reports.shutdown();
    }
}
