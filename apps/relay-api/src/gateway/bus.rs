//! Group bus for fanning session messages out across relay processes.
//!
//! Every process holds one bus handle. A process subscribes to a session's
//! topic while it has at least one local connection in that session (the
//! [`ConnectionRegistry`](super::registry::ConnectionRegistry) keeps the
//! refcount). Delivery is at-most-once; ordering is whatever the backing
//! fabric gives per topic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::ApiError;

use super::backoff::backoff_delay;

/// Capacity of the in-memory fabric. Slow buses that fall behind skip
/// messages (RecvError::Lagged).
const FABRIC_CAPACITY: usize = 4096;

/// Longest a topic name may be after sanitisation (excluding the prefix).
const MAX_TOPIC_LEN: usize = 80;

/// How long a subscribe/unsubscribe waits for the pub/sub task to confirm.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound between pub/sub reconnect attempts.
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// A session message in flight between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Exact session id; receivers filter on it because topics are sanitised.
    pub session_id: String,
    /// Publishing connection id.
    pub sender: String,
    pub user_type: String,
    pub client_type: String,
    #[serde(default)]
    pub msg: Value,
    #[serde(default)]
    pub data: Value,
}

/// Callback invoked for every message received on a subscribed topic.
pub type BusHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

#[async_trait]
pub trait GroupBus: Send + Sync {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<(), ApiError>;
    /// Route messages on `topic` to `handler`. Replaces any previous handler.
    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<(), ApiError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), ApiError>;
}

/// Bus topic for a session id. Anything outside `[A-Za-z0-9_.-]` becomes `_`
/// and the name is truncated, so distinct session ids may share a topic.
pub fn topic_for(prefix: &str, session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TOPIC_LEN)
        .collect();
    format!("{prefix}:session.{safe}")
}

fn dispatch(handlers: &DashMap<String, BusHandler>, topic: &str, message: BusMessage) {
    // Clone the handler out so the shard lock is not held while it runs.
    let handler = handlers.get(topic).map(|h| h.value().clone());
    if let Some(handler) = handler {
        handler(message);
    }
}

// ---------------------------------------------------------------------------
// In-memory fabric (single process / tests)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Envelope {
    topic: String,
    message: BusMessage,
}

/// Shared in-memory medium. Every [`MemoryBus`] attached to the same fabric
/// behaves like a separate process on the same Redis.
#[derive(Clone)]
pub struct MemoryFabric {
    sender: broadcast::Sender<Arc<Envelope>>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FABRIC_CAPACITY);
        Self { sender }
    }

    /// Attach a new bus handle. Must be called inside a tokio runtime.
    pub fn attach(&self) -> MemoryBus {
        let handlers: Arc<DashMap<String, BusHandler>> = Arc::new(DashMap::new());
        let mut rx = self.sender.subscribe();
        let pump_handlers = handlers.clone();
        let pump = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        dispatch(&pump_handlers, &envelope.topic, envelope.message.clone());
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "memory bus lagged behind fabric");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        MemoryBus {
            fabric: self.clone(),
            handlers,
            pump,
        }
    }
}

impl Default for MemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryBus {
    fabric: MemoryFabric,
    handlers: Arc<DashMap<String, BusHandler>>,
    pump: JoinHandle<()>,
}

impl MemoryBus {
    /// Whether this handle currently routes `topic` anywhere.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl GroupBus for MemoryBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<(), ApiError> {
        // send() fails only when no bus is attached; nobody to deliver to.
        let _ = self.fabric.sender.send(Arc::new(Envelope {
            topic: topic.to_string(),
            message: message.clone(),
        }));
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<(), ApiError> {
        self.handlers.insert(topic.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ApiError> {
        self.handlers.remove(topic);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis pub/sub implementation
// ---------------------------------------------------------------------------

enum Command {
    Subscribe(String, oneshot::Sender<Result<(), ApiError>>),
    Unsubscribe(String, oneshot::Sender<Result<(), ApiError>>),
}

enum PumpEvent {
    Command(Option<Command>),
    Message(Option<redis::Msg>),
}

/// Redis-backed bus. Publishes go through a managed connection; a background
/// task owns the dedicated pub/sub connection, applies subscription commands,
/// dispatches incoming messages, and reconnects (re-subscribing every live
/// topic) if the connection drops.
pub struct RedisBus {
    publisher: ConnectionManager,
    handlers: Arc<DashMap<String, BusHandler>>,
    commands: mpsc::Sender<Command>,
    pump: JoinHandle<()>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, ApiError> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let pubsub = client.get_async_pubsub().await?;

        let handlers: Arc<DashMap<String, BusHandler>> = Arc::new(DashMap::new());
        let (commands, rx) = mpsc::channel(64);
        let pump = tokio::spawn(run_pubsub(client, pubsub, rx, handlers.clone()));

        tracing::info!("redis group bus connected");
        Ok(Self {
            publisher,
            handlers,
            commands,
            pump,
        })
    }

    async fn send_command(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), ApiError>>) -> Command,
    ) -> Result<(), ApiError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| ApiError::unavailable("Group bus stopped"))?;
        match tokio::time::timeout(COMMAND_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ApiError::unavailable("Group bus stopped")),
            Err(_) => Err(ApiError::unavailable("Group bus timed out")),
        }
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl GroupBus for RedisBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<(), ApiError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.publisher.clone();
        let _: i64 = conn.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<(), ApiError> {
        self.handlers.insert(topic.to_string(), handler);
        let topic_owned = topic.to_string();
        let result = self
            .send_command(|reply| Command::Subscribe(topic_owned, reply))
            .await;
        if result.is_err() {
            self.handlers.remove(topic);
        }
        result
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ApiError> {
        self.handlers.remove(topic);
        let topic_owned = topic.to_string();
        self.send_command(|reply| Command::Unsubscribe(topic_owned, reply))
            .await
    }
}

async fn run_pubsub(
    client: redis::Client,
    mut pubsub: redis::aio::PubSub,
    mut commands: mpsc::Receiver<Command>,
    handlers: Arc<DashMap<String, BusHandler>>,
) {
    loop {
        let event = {
            let messages = pubsub.on_message();
            tokio::pin!(messages);
            tokio::select! {
                cmd = commands.recv() => PumpEvent::Command(cmd),
                msg = messages.next() => PumpEvent::Message(msg),
            }
        };

        match event {
            PumpEvent::Command(None) => break,
            PumpEvent::Command(Some(Command::Subscribe(topic, reply))) => {
                let result = pubsub.subscribe(&topic).await.map_err(ApiError::from);
                let _ = reply.send(result);
            }
            PumpEvent::Command(Some(Command::Unsubscribe(topic, reply))) => {
                let result = pubsub.unsubscribe(&topic).await.map_err(ApiError::from);
                let _ = reply.send(result);
            }
            PumpEvent::Message(Some(msg)) => {
                let topic = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::warn!(?err, %topic, "undecodable bus payload");
                        continue;
                    }
                };
                match serde_json::from_str::<BusMessage>(&payload) {
                    Ok(message) => dispatch(&handlers, &topic, message),
                    Err(err) => tracing::warn!(?err, %topic, "malformed bus message"),
                }
            }
            PumpEvent::Message(None) => {
                tracing::error!("redis pub/sub connection lost");
                pubsub = reconnect(&client, &handlers).await;
            }
        }
    }
}

/// Re-open the pub/sub connection and restore every live subscription.
async fn reconnect(client: &redis::Client, handlers: &DashMap<String, BusHandler>) -> redis::aio::PubSub {
    let mut failures = 0u32;
    loop {
        failures += 1;
        tokio::time::sleep(backoff_delay(failures, RECONNECT_CAP)).await;

        let mut pubsub = match client.get_async_pubsub().await {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(?err, failures, "redis pub/sub reconnect failed");
                continue;
            }
        };
        let topics: Vec<String> = handlers.iter().map(|e| e.key().clone()).collect();
        let mut restored = true;
        for topic in &topics {
            if let Err(err) = pubsub.subscribe(topic).await {
                tracing::warn!(?err, %topic, "re-subscribe failed");
                restored = false;
                break;
            }
        }
        if restored {
            tracing::info!(topics = topics.len(), "redis pub/sub reconnected");
            return pubsub;
        }
    }
}
