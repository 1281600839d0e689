//! Per-process table of open relay connections.
//!
//! Besides the connection table, the registry owns this process's group-bus
//! subscriptions: a topic is subscribed when its first local connection joins
//! and unsubscribed when its last one leaves.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

use crate::error::ApiError;

use super::bus::{topic_for, BusHandler, BusMessage, GroupBus};
use super::events::ServerMessage;

/// Capacity of each connection's outbound queue. A full queue drops
/// deliveries rather than stalling the bus.
pub const OUTBOUND_BUFFER: usize = 256;

/// A connection owned by this process, with its local delivery handle.
pub struct LocalConnection {
    pub connection_id: String,
    pub session_id: String,
    pub user_type: String,
    pub client_type: String,
    pub outbound: mpsc::Sender<ServerMessage>,
}

/// Shared registry of this process's relay connections.
///
/// Uses `DashMap` for the connection table so bus deliveries and
/// joins/leaves don't contend on one lock. Subscription refcounts sit behind
/// a single async mutex: every subscribe/unsubscribe is awaited while it is
/// held, so a last-leave racing a first-join cannot drop a live subscription.
pub struct ConnectionRegistry {
    bus: Arc<dyn GroupBus>,
    topic_prefix: String,
    connections: DashMap<String, LocalConnection>,
    topics: Mutex<HashMap<String, usize>>,
}

impl ConnectionRegistry {
    pub fn new(bus: Arc<dyn GroupBus>, topic_prefix: &str) -> Self {
        Self {
            bus,
            topic_prefix: topic_prefix.to_string(),
            connections: DashMap::new(),
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<dyn GroupBus> {
        &self.bus
    }

    /// Bus topic carrying messages for `session_id`.
    pub fn topic(&self, session_id: &str) -> String {
        topic_for(&self.topic_prefix, session_id)
    }

    /// Register a connection, subscribing this process to its session topic if
    /// it is the first local connection there. On subscribe failure nothing is
    /// registered.
    pub async fn join(self: &Arc<Self>, connection: LocalConnection) -> Result<(), ApiError> {
        let topic = self.topic(&connection.session_id);
        let mut topics = self.topics.lock().await;

        let current = topics.get(&topic).copied().unwrap_or(0);
        if current == 0 {
            let registry = Arc::downgrade(self);
            let handler: BusHandler = Arc::new(move |message| {
                if let Some(registry) = registry.upgrade() {
                    registry.deliver(&message);
                }
            });
            self.bus.subscribe(&topic, handler).await?;
            tracing::debug!(%topic, "subscribed to session topic");
        }
        topics.insert(topic, current + 1);
        self.connections
            .insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    /// Remove a connection, unsubscribing from its topic if it was the last
    /// local one. Returns `false` if the connection was not registered.
    pub async fn leave(&self, connection_id: &str) -> bool {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return false;
        };
        let topic = self.topic(&connection.session_id);
        let mut topics = self.topics.lock().await;

        let remaining = match topics.get_mut(&topic) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return true,
        };
        if remaining == 0 {
            topics.remove(&topic);
            match self.bus.unsubscribe(&topic).await {
                Ok(()) => tracing::debug!(%topic, "unsubscribed from session topic"),
                Err(err) => tracing::warn!(%topic, %err, "unsubscribe failed"),
            }
        }
        true
    }

    /// Hand a bus message to every local connection in its session.
    /// Returns how many connections accepted it.
    pub fn deliver(&self, message: &BusMessage) -> usize {
        let outbound = ServerMessage::SessionMessage {
            user_type: message.user_type.clone(),
            client_type: message.client_type.clone(),
            msg: message.msg.clone(),
            data: message.data.clone(),
        };

        let mut delivered = 0;
        for entry in self.connections.iter() {
            let connection = entry.value();
            // Topics are sanitised, so filter on the exact session id.
            if connection.session_id != message.session_id {
                continue;
            }
            match connection.outbound.try_send(outbound.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        connection_id = %connection.connection_id,
                        session_id = %connection.session_id,
                        "outbound queue full, dropping session message"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(
                        connection_id = %connection.connection_id,
                        "outbound queue closed"
                    );
                }
            }
        }
        delivered
    }

    /// Number of connections owned by this process.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[cfg(test)]
    fn session_connections(&self, session_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .count()
    }

    /// Number of bus topics this process is subscribed to.
    pub async fn subscribed_topics(&self) -> usize {
        self.topics.lock().await.len()
    }
}
