use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Fallback `client_type` when the handshake does not provide one.
pub const DEFAULT_CLIENT_TYPE: &str = "unknown";

/// Presence metadata for one live connection, keyed by connection id in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub session_id: String,
    pub user_type: String,
    pub client_type: String,
    /// Unix seconds, set once at handshake.
    pub connected_at: i64,
    /// Unix seconds, bumped by every presence refresh.
    pub last_seen: i64,
}

impl ConnectionRecord {
    pub fn new(session_id: &str, user_type: &str, client_type: &str, now: i64) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_type: user_type.to_string(),
            client_type: client_type.to_string(),
            connected_at: now,
            last_seen: now,
        }
    }

    /// Flatten into hash fields for stores that keep records as string maps.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("session_id", self.session_id.clone()),
            ("user_type", self.user_type.clone()),
            ("client_type", self.client_type.clone()),
            ("connected_at", self.connected_at.to_string()),
            ("last_seen", self.last_seen.to_string()),
        ]
    }

    /// Rebuild a record from hash fields. Returns `None` for an empty or
    /// partial hash (a refresh racing a delete can leave one behind).
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let session_id = fields.get("session_id")?.clone();
        let user_type = fields.get("user_type")?.clone();
        let client_type = fields
            .get("client_type")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CLIENT_TYPE.to_string());
        let connected_at = fields
            .get("connected_at")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_seen = fields
            .get("last_seen")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Some(Self {
            session_id,
            user_type,
            client_type,
            connected_at,
            last_seen,
        })
    }
}
