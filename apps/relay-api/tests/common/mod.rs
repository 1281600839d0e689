#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use relay_api::config::Config;
use relay_api::db::kv::MemoryStore;
use relay_api::gateway::bus::MemoryFabric;
use relay_api::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Shared store and bus medium. Every state built from one cluster behaves
/// like a separate relay process on the same Redis.
pub struct Cluster {
    pub fabric: MemoryFabric,
    pub store: Arc<MemoryStore>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            fabric: MemoryFabric::new(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// A new process-local state attached to this cluster.
    pub fn process(&self, config: Config) -> AppState {
        AppState::new(config, self.store.clone(), Arc::new(self.fabric.attach()))
    }
}

pub fn test_config() -> Config {
    Config {
        instance_id: "test-instance".to_string(),
        ..Config::default()
    }
}

/// Build the full application router wired to a fresh single-process state.
pub fn test_app() -> (Router, AppState) {
    test_app_with(test_config())
}

pub fn test_app_with(config: Config) -> (Router, AppState) {
    let cluster = Cluster::new();
    let state = cluster.process(config);
    let app = relay_api::routes::router().with_state(state.clone());
    (app, state)
}

/// Start an actual TCP server for `state`. The server runs in the background.
pub async fn start_ws_server(state: AppState) -> SocketAddr {
    let app = relay_api::routes::router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

pub async fn connect(addr: SocketAddr, session_id: &str) -> Ws {
    let url = format!("ws://{addr}/ws/session/{session_id}/");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next frame, skipping ping/pong.
pub async fn next_frame(ws: &mut Ws) -> tungstenite::Message {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => return other,
        }
    }
}

pub async fn recv_json(ws: &mut Ws) -> Value {
    let msg = next_frame(ws).await;
    let text = msg.into_text().expect("not text");
    serde_json::from_str(&text).expect("parse frame")
}

/// Read until the close frame and return its code.
pub async fn expect_close(ws: &mut Ws) -> u16 {
    match next_frame(ws).await {
        tungstenite::Message::Close(Some(frame)) => u16::from(frame.code),
        other => panic!("Expected Close frame, got: {other:?}"),
    }
}

/// Connect to `session_id` and complete the handshake. Returns the socket and
/// the server-assigned connection id.
pub async fn join(addr: SocketAddr, session_id: &str, user_type: &str, client_type: &str) -> (Ws, String) {
    let mut ws = connect(addr, session_id).await;
    send_json(
        &mut ws,
        serde_json::json!({ "type": "hello", "user_type": user_type, "client_type": client_type }),
    )
    .await;

    let connected = recv_json(&mut ws).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["session_id"], session_id);
    assert_eq!(connected["user_type_required"], true);
    let connection_id = connected["connection_id"]
        .as_str()
        .expect("connection_id present")
        .to_string();
    (ws, connection_id)
}

pub async fn presence(ws: &mut Ws) -> Value {
    send_json(ws, serde_json::json!({ "type": "presence" })).await;
    let reply = recv_json(ws).await;
    assert_eq!(reply["type"], "presence");
    reply
}

/// Poll `presence` until `count` matches or the deadline passes.
pub async fn wait_for_count(ws: &mut Ws, count: u64) -> Value {
    let deadline = time::Instant::now() + Duration::from_secs(3);
    loop {
        let reply = presence(ws).await;
        if reply["count"] == count || time::Instant::now() >= deadline {
            return reply;
        }
        time::sleep(Duration::from_millis(25)).await;
    }
}
