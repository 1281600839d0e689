//! Presence queries over the shared store, and the per-connection refresh
//! activity that keeps a live connection's record from expiring.
//!
//! Membership sets and records are updated non-atomically, so a set can hold
//! ids whose record is gone (owner died, TTL lapsed). Those ids are never
//! reported and are pruned from the set whenever a presence query sees them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::db::kv::PresenceStore;
use crate::error::ApiError;
use crate::models::connection::ConnectionRecord;

use super::backoff::backoff_delay;
use super::events::{PresenceMember, ServerMessage};

/// Build the `presence` reply for `session_id`.
///
/// Members are ordered by `(connected_at, connection_id)` and tallied by
/// `user_type`.
pub async fn collect_presence(store: &dyn PresenceStore, session_id: &str) -> Result<ServerMessage, ApiError> {
    let ids = store.list_members(session_id).await?;

    let mut members = Vec::with_capacity(ids.len());
    let mut stale = Vec::new();
    for id in ids {
        match store.get_record(&id).await? {
            Some(record) if record.session_id == session_id => members.push(PresenceMember {
                connection_id: id,
                user_type: record.user_type,
                client_type: record.client_type,
                connected_at: record.connected_at,
                last_seen: record.last_seen,
            }),
            _ => stale.push(id),
        }
    }

    for id in &stale {
        if let Err(err) = store.remove_member(session_id, id).await {
            tracing::debug!(%session_id, connection_id = %id, %err, "stale member prune failed");
        }
    }
    if !stale.is_empty() {
        tracing::debug!(%session_id, pruned = stale.len(), "pruned stale presence members");
    }

    members.sort_by(|a, b| {
        (a.connected_at, &a.connection_id).cmp(&(b.connected_at, &b.connection_id))
    });

    let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
    for member in &members {
        *by_type.entry(member.user_type.clone()).or_insert(0) += 1;
    }

    Ok(ServerMessage::Presence {
        session_id: session_id.to_string(),
        count: members.len(),
        by_type,
        members,
    })
}

/// Result of one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// The record had expired (e.g. during a store outage) and was re-created.
    Recreated,
}

/// Extend the record's TTL and re-assert membership. A missing record is
/// re-created with its original `connected_at`.
pub async fn refresh_once(
    store: &dyn PresenceStore,
    connection_id: &str,
    record: &ConnectionRecord,
    ttl_secs: u64,
) -> Result<RefreshOutcome, ApiError> {
    let outcome = if store.refresh(connection_id, ttl_secs).await? {
        RefreshOutcome::Refreshed
    } else {
        let revived = ConnectionRecord {
            last_seen: relay_common::clock::unix_now(),
            ..record.clone()
        };
        store.put_record(connection_id, &revived, ttl_secs).await?;
        RefreshOutcome::Recreated
    };
    store.add_member(&record.session_id, connection_id).await?;
    Ok(outcome)
}

/// Background refresh bound to one connection. Dropping the handle aborts
/// the task; [`RefreshTask::stop`] also waits for it to finish so no refresh
/// can land after the connection's cleanup.
pub struct RefreshTask {
    handle: Option<JoinHandle<()>>,
}

impl RefreshTask {
    pub fn spawn(
        store: Arc<dyn PresenceStore>,
        connection_id: String,
        record: ConnectionRecord,
        ttl_secs: u64,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let delay = if failures == 0 {
                    interval
                } else {
                    backoff_delay(failures, interval)
                };
                tokio::time::sleep(delay).await;

                match refresh_once(store.as_ref(), &connection_id, &record, ttl_secs).await {
                    Ok(RefreshOutcome::Refreshed) => failures = 0,
                    Ok(RefreshOutcome::Recreated) => {
                        failures = 0;
                        tracing::info!(%connection_id, session_id = %record.session_id, "presence record re-created");
                    }
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        tracing::warn!(%connection_id, failures, %err, "presence refresh failed");
                    }
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;

    async fn join(store: &MemoryStore, id: &str, session_id: &str, user_type: &str, connected_at: i64) {
        let record = ConnectionRecord::new(session_id, user_type, "web", connected_at);
        store.put_record(id, &record, 60).await.unwrap();
        store.add_member(session_id, id).await.unwrap();
    }

    #[tokio::test]
    async fn presence_tallies_by_user_type_in_join_order() {
        let store = MemoryStore::new();
        join(&store, "c2", "room-1", "guest", 200).await;
        join(&store, "c1", "room-1", "admin", 100).await;
        join(&store, "c3", "room-1", "guest", 200).await;
        join(&store, "c9", "room-2", "admin", 50).await;

        let reply = collect_presence(&store, "room-1").await.unwrap();
        match reply {
            ServerMessage::Presence {
                session_id,
                count,
                by_type,
                members,
            } => {
                assert_eq!(session_id, "room-1");
                assert_eq!(count, 3);
                assert_eq!(by_type.get("admin"), Some(&1));
                assert_eq!(by_type.get("guest"), Some(&2));
                let order: Vec<&str> = members.iter().map(|m| m.connection_id.as_str()).collect();
                assert_eq!(order, vec!["c1", "c2", "c3"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn presence_prunes_ids_without_live_record() {
        let store = MemoryStore::new();
        join(&store, "c1", "room-1", "admin", 100).await;
        // Owner died without cleanup: id in the set, record gone.
        store.add_member("room-1", "ghost").await.unwrap();
        // Record belongs to another session.
        join(&store, "c5", "room-2", "guest", 100).await;
        store.add_member("room-1", "c5").await.unwrap();

        match collect_presence(&store, "room-1").await.unwrap() {
            ServerMessage::Presence { count, .. } => assert_eq!(count, 1),
            other => panic!("unexpected {other:?}"),
        }
        let remaining = store.list_members("room-1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains("c1"));
        // The other session's record is untouched.
        assert!(store.get_record("c5").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_session_reports_zero() {
        let store = MemoryStore::new();
        match collect_presence(&store, "nobody").await.unwrap() {
            ServerMessage::Presence { count, members, by_type, .. } => {
                assert_eq!(count, 0);
                assert!(members.is_empty());
                assert!(by_type.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_recreates_missing_record_keeping_connected_at() {
        let store = MemoryStore::new();
        let record = ConnectionRecord::new("room-1", "admin", "web", 1_700_000_000);

        let outcome = refresh_once(&store, "c1", &record, 60).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Recreated);

        let revived = store.get_record("c1").await.unwrap().unwrap();
        assert_eq!(revived.connected_at, 1_700_000_000);
        assert!(store.list_members("room-1").await.unwrap().contains("c1"));

        let outcome = refresh_once(&store, "c1", &record, 60).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed);
    }

    #[tokio::test]
    async fn stopped_refresh_task_never_writes_again() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryStore::new());
        let record = ConnectionRecord::new("room-1", "admin", "web", 1_700_000_000);
        let task = RefreshTask::spawn(
            store.clone(),
            "c1".to_string(),
            record,
            60,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get_record("c1").await.unwrap().is_some());

        task.stop().await;
        store.delete_record("c1").await.unwrap();
        store.remove_member("room-1", "c1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.get_record("c1").await.unwrap().is_none());
        assert!(store.list_members("room-1").await.unwrap().is_empty());
    }
}
