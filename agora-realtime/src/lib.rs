//! # agora-realtime — live presence client for the Agora moderation console
//!
//! Multiplexes one persistent server-push connection per domain into typed
//! events, tracks which users are viewing which item, and recovers
//! automatically from connection loss.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐   view_item(x)   ┌───────────────────┐
//! │ PresenceAggregator │ ───────────────► │ ConnectionManager │
//! │ (per consumer)     │                  │ (per domain)      │
//! └─────────▲──────────┘                  └─────┬──────┬──────┘
//!           │ viewer_joined /                   │      │
//!           │ viewer_left                       │      ▼
//!           │                                   │  HeartbeatScheduler
//!     ┌─────┴────┐      frames (JSON)           │      │ POST /viewing/<id>
//!     │ EventBus │ ◄───────────────── PushSocket│      ▼
//!     └──────────┘                     (WebSocket)   server
//! ```
//!
//! Connection loss drives a bounded exponential backoff loop; consumers see
//! only `connection.*` status events, never errors. Heartbeats pause while
//! the app is backgrounded and resume — with one immediate catch-up send —
//! on return to the foreground.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON frame envelope and presence payload parsing
//! - [`events`] — typed event bus with disposable subscriptions
//! - [`transport`] — push-stream abstraction + WebSocket implementation
//! - [`connection`] — refcounted manager with backoff reconnection
//! - [`heartbeat`] — viewing heartbeats with visibility coupling
//! - [`presence`] — per-item viewer aggregation for one domain
//! - [`registry`] — explicit per-domain instances (queue, reports)

pub mod connection;
pub mod events;
pub mod heartbeat;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-exports for convenience
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStats, StatsSnapshot,
};
pub use events::{EventBus, EventKind, RealtimeEvent, Subscription};
pub use heartbeat::{
    AlwaysForeground, HeartbeatScheduler, HttpPresenceSender, ManualVisibility, PresenceSender,
    VisibilitySignal,
};
pub use presence::PresenceAggregator;
pub use protocol::{Envelope, ItemPresence, PresenceChange, RealtimeError, Viewer};
pub use registry::{DomainConfig, RealtimeRegistry, RegistryConfig};
pub use transport::{PushSocket, PushTransport, WebSocketTransport};
