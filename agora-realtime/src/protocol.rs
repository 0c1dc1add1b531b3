//! JSON wire envelope and presence payload parsing.
//!
//! Every push frame is one JSON object:
//! ```text
//! { "type": "<domain>.<event>", "payload": { ... } }
//! ```
//!
//! The envelope is decoded with serde_json; a frame that fails to decode is
//! dropped by the connection layer without touching connection state.
//! Presence payloads carry the item id under a per-domain field name
//! (`postId` for the queue, `reportId` for reports) — [`parse_presence_payload`]
//! resolves the configured field first and falls back to the other known
//! names so both domains survive a server-side rename.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Item-id field names checked, in order, when the configured field is absent.
pub const ITEM_ID_FALLBACKS: [&str; 3] = ["postId", "reportId", "itemId"];

/// Decoded push frame: event type tag plus opaque JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload; interpretation is per event type.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, RealtimeError> {
        serde_json::from_str(text).map_err(|e| RealtimeError::Decode(e.to_string()))
    }

    /// Encode back to a single-frame string (used by test servers).
    pub fn encode(&self) -> Result<String, RealtimeError> {
        serde_json::to_string(self).map_err(|e| RealtimeError::Decode(e.to_string()))
    }
}

/// A user currently viewing an item. Equality is by `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewer {
    pub user_id: u64,
    pub user_name: String,
}

/// One entry of the initial presence snapshot delivered with a page load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPresence {
    pub item_id: u64,
    #[serde(default)]
    pub viewers: Vec<Viewer>,
}

/// Parsed `viewer_joined` / `viewer_left` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceChange {
    pub item_id: u64,
    pub viewer: Viewer,
}

/// Extract a presence change from a join/leave payload.
///
/// `userName` is optional on leave events — removal only needs the id.
pub fn parse_presence_payload(
    payload: &Value,
    item_id_field: &str,
) -> Result<PresenceChange, RealtimeError> {
    let item_id = item_id_from(payload, item_id_field)?;
    let user_id = payload
        .get("userId")
        .and_then(Value::as_u64)
        .ok_or(RealtimeError::MissingField("userId"))?;
    let user_name = payload
        .get("userName")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    Ok(PresenceChange {
        item_id,
        viewer: Viewer { user_id, user_name },
    })
}

fn item_id_from(payload: &Value, primary: &str) -> Result<u64, RealtimeError> {
    if let Some(id) = payload.get(primary).and_then(Value::as_u64) {
        return Ok(id);
    }
    for field in ITEM_ID_FALLBACKS {
        if field != primary {
            if let Some(id) = payload.get(field).and_then(Value::as_u64) {
                return Ok(id);
            }
        }
    }
    Err(RealtimeError::MissingField("item id"))
}

/// Errors surfaced by the realtime core.
///
/// Nothing here crosses the public API boundary under normal network
/// conditions — transport and decode failures degrade to status events and
/// dropped frames.
#[derive(Debug, Clone)]
pub enum RealtimeError {
    Decode(String),
    MissingField(&'static str),
    Transport(String),
    ConnectionClosed,
}

impl std::fmt::Display for RealtimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::MissingField(field) => write!(f, "Missing payload field: {field}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for RealtimeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope {
            event_type: "queue.viewer_joined".into(),
            payload: json!({ "postId": 5, "userId": 1, "userName": "A" }),
        };

        let encoded = env.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();

        assert_eq!(decoded.event_type, "queue.viewer_joined");
        assert_eq!(decoded.payload["postId"], 5);
    }

    #[test]
    fn test_envelope_missing_payload_defaults_null() {
        let decoded = Envelope::decode(r#"{"type":"queue.item_created"}"#).unwrap();
        assert_eq!(decoded.event_type, "queue.item_created");
        assert!(decoded.payload.is_null());
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"payload":{}}"#).is_err()); // no type tag
    }

    #[test]
    fn test_viewer_field_names() {
        let v: Viewer = serde_json::from_value(json!({ "userId": 7, "userName": "Mira" })).unwrap();
        assert_eq!(v.user_id, 7);
        assert_eq!(v.user_name, "Mira");

        let back = serde_json::to_value(&v).unwrap();
        assert_eq!(back["userId"], 7);
        assert_eq!(back["userName"], "Mira");
    }

    #[test]
    fn test_snapshot_entry_viewers_default_empty() {
        let entry: ItemPresence = serde_json::from_value(json!({ "itemId": 3 })).unwrap();
        assert_eq!(entry.item_id, 3);
        assert!(entry.viewers.is_empty());
    }

    #[test]
    fn test_parse_presence_primary_field() {
        let payload = json!({ "postId": 5, "userId": 2, "userName": "B" });
        let change = parse_presence_payload(&payload, "postId").unwrap();
        assert_eq!(change.item_id, 5);
        assert_eq!(change.viewer.user_id, 2);
        assert_eq!(change.viewer.user_name, "B");
    }

    #[test]
    fn test_parse_presence_fallback_field() {
        // Configured for reportId but the payload carries itemId.
        let payload = json!({ "itemId": 9, "userId": 4, "userName": "D" });
        let change = parse_presence_payload(&payload, "reportId").unwrap();
        assert_eq!(change.item_id, 9);
    }

    #[test]
    fn test_parse_presence_missing_user_name() {
        let payload = json!({ "reportId": 11, "userId": 6 });
        let change = parse_presence_payload(&payload, "reportId").unwrap();
        assert_eq!(change.viewer.user_id, 6);
        assert!(change.viewer.user_name.is_empty());
    }

    #[test]
    fn test_parse_presence_missing_ids() {
        let no_item = json!({ "userId": 6, "userName": "F" });
        assert!(parse_presence_payload(&no_item, "postId").is_err());

        let no_user = json!({ "postId": 5, "userName": "F" });
        assert!(parse_presence_payload(&no_user, "postId").is_err());
    }

    #[test]
    fn test_error_display() {
        let e = RealtimeError::MissingField("userId");
        assert!(e.to_string().contains("userId"));
    }
}
