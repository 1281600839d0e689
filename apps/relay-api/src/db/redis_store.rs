//! Redis-backed presence store shared by every relay instance.
//!
//! Layout:
//! - `<prefix>:conn:<connection_id>`: hash holding the connection record, with TTL.
//! - `<prefix>:session:<session_id>:members`: set of connection ids, with TTL
//!   re-extended on every `add_member`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::db::kv::PresenceStore;
use crate::error::ApiError;
use crate::models::connection::ConnectionRecord;

/// Touch `last_seen` and the TTL only if the record still exists, so a refresh
/// racing a delete cannot resurrect a half-empty hash.
const REFRESH_IF_EXISTS: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  redis.call("HSET", KEYS[1], "last_seen", ARGV[1])
  redis.call("EXPIRE", KEYS[1], tonumber(ARGV[2]))
  return 1
end
return 0
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    member_ttl_secs: u64,
    refresh_script: redis::Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, prefix: &str, member_ttl_secs: u64) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            member_ttl_secs,
            refresh_script: redis::Script::new(REFRESH_IF_EXISTS),
        }
    }

    /// Open a managed (auto-reconnecting) connection to `url`.
    pub async fn connect(url: &str, prefix: &str, member_ttl_secs: u64) -> Result<Self, ApiError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(%prefix, "redis presence store connected");
        Ok(Self::new(conn, prefix, member_ttl_secs))
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}:conn:{}", self.prefix, id)
    }

    fn members_key(&self, session_id: &str) -> String {
        format!("{}:session:{}:members", self.prefix, session_id)
    }
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn put_record(&self, id: &str, record: &ConnectionRecord, ttl_secs: u64) -> Result<(), ApiError> {
        let key = self.record_key(id);
        let fields = record.to_fields();
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .hset_multiple(&key, fields.as_slice())
            .ignore()
            .expire(&key, ttl_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn refresh(&self, id: &str, ttl_secs: u64) -> Result<bool, ApiError> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = self
            .refresh_script
            .key(self.record_key(id))
            .arg(relay_common::clock::unix_now())
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn get_record(&self, id: &str) -> Result<Option<ConnectionRecord>, ApiError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.record_key(id)).await?;
        Ok(ConnectionRecord::from_fields(&fields))
    }

    async fn delete_record(&self, id: &str) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.record_key(id)).await?;
        Ok(())
    }

    async fn add_member(&self, session_id: &str, id: &str) -> Result<(), ApiError> {
        let key = self.members_key(session_id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .sadd(&key, id)
            .ignore()
            .expire(&key, self.member_ttl_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_member(&self, session_id: &str, id: &str) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(self.members_key(session_id), id).await?;
        Ok(())
    }

    async fn list_members(&self, session_id: &str) -> Result<HashSet<String>, ApiError> {
        let mut conn = self.conn.clone();
        let members: HashSet<String> = conn.smembers(self.members_key(session_id)).await?;
        Ok(members)
    }
}
