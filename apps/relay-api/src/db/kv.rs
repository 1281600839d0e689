use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ApiError;
use crate::models::connection::ConnectionRecord;

/// Shared presence store: connection records with TTL plus per-session
/// membership sets.
///
/// Backed by Redis in production and an in-memory map in tests. Every
/// operation must be safe to call concurrently from many processes; the
/// store's own atomicity is the only coordination the relay relies on.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn put_record(&self, id: &str, record: &ConnectionRecord, ttl_secs: u64) -> Result<(), ApiError>;
    /// Bump `last_seen` and the TTL. Returns `false` if the record is gone.
    async fn refresh(&self, id: &str, ttl_secs: u64) -> Result<bool, ApiError>;
    async fn get_record(&self, id: &str) -> Result<Option<ConnectionRecord>, ApiError>;
    async fn delete_record(&self, id: &str) -> Result<(), ApiError>;
    async fn add_member(&self, session_id: &str, id: &str) -> Result<(), ApiError>;
    async fn remove_member(&self, session_id: &str, id: &str) -> Result<(), ApiError>;
    async fn list_members(&self, session_id: &str) -> Result<HashSet<String>, ApiError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single process / tests)
// ---------------------------------------------------------------------------

struct Expiring {
    record: ConnectionRecord,
    expires_at: Instant,
}

impl Expiring {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

pub struct MemoryStore {
    records: Mutex<HashMap<String, Expiring>>,
    members: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn put_record(&self, id: &str, record: &ConnectionRecord, ttl_secs: u64) -> Result<(), ApiError> {
        self.records.lock().insert(
            id.to_string(),
            Expiring {
                record: record.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn refresh(&self, id: &str, ttl_secs: u64) -> Result<bool, ApiError> {
        let now = Instant::now();
        let mut records = self.records.lock();
        match records.get_mut(id) {
            Some(entry) if entry.is_live(now) => {
                entry.record.last_seen = relay_common::clock::unix_now();
                entry.expires_at = now + Duration::from_secs(ttl_secs);
                Ok(true)
            }
            Some(_) => {
                records.remove(id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn get_record(&self, id: &str) -> Result<Option<ConnectionRecord>, ApiError> {
        let now = Instant::now();
        let mut records = self.records.lock();
        match records.get(id) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.record.clone())),
            Some(_) => {
                records.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete_record(&self, id: &str) -> Result<(), ApiError> {
        self.records.lock().remove(id);
        Ok(())
    }

    async fn add_member(&self, session_id: &str, id: &str) -> Result<(), ApiError> {
        self.members
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(id.to_string());
        Ok(())
    }

    async fn remove_member(&self, session_id: &str, id: &str) -> Result<(), ApiError> {
        let mut members = self.members.lock();
        if let Some(set) = members.get_mut(session_id) {
            set.remove(id);
            if set.is_empty() {
                members.remove(session_id);
            }
        }
        Ok(())
    }

    async fn list_members(&self, session_id: &str) -> Result<HashSet<String>, ApiError> {
        Ok(self
            .members
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}
