//! WebSocket upgrade handler and per-connection event loop.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_common::id::{ConnectionId, PrefixedId};
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::auth::middleware::ApiKey;
use crate::AppState;

use super::events::ServerMessage;
use super::registry::OUTBOUND_BUFFER;
use super::session::{RelayConnection, Step, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION};

type WsSink = SplitSink<WebSocket, Message>;

/// One inbound transport event, control frames already filtered out.
enum Inbound {
    Text(String),
    Binary,
    Gone,
}

/// Why the event loop stopped.
enum Exit {
    ClientGone,
    ServerClosed(u16),
    Shutdown,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/session/{session_id}", get(ws_upgrade))
        .route("/ws/session/{session_id}/", get(ws_upgrade))
}

async fn ws_upgrade(
    _key: ApiKey,
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, session_id))
}

async fn handle_connection(socket: WebSocket, state: AppState, session_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);
    let mut shutdown = state.shutdown.subscribe();

    let connection_id = ConnectionId::generate();
    let mut conn = RelayConnection::new(state.clone(), connection_id, session_id, outbound_tx);
    tracing::info!(
        connection_id = %conn.connection_id(),
        session_id = %conn.session_id(),
        "relay connection opened"
    );

    let handshake_deadline = time::sleep(state.config.handshake_timeout());
    tokio::pin!(handshake_deadline);

    let exit = loop {
        tokio::select! {
            inbound = next_inbound(&mut ws_rx) => {
                let step = match inbound {
                    Inbound::Text(text) => conn.handle_text(&text).await,
                    Inbound::Binary => conn.handle_binary().await,
                    Inbound::Gone => break Exit::ClientGone,
                };
                match step {
                    Step::Reply(message) => {
                        if send_message(&mut ws_tx, &message).await.is_err() {
                            break Exit::ClientGone;
                        }
                    }
                    Step::Silent => {}
                    Step::Close { reply, code, reason } => {
                        if let Some(message) = reply {
                            let _ = send_message(&mut ws_tx, &message).await;
                        }
                        let _ = send_close(&mut ws_tx, code, reason).await;
                        break Exit::ServerClosed(code);
                    }
                }
            }

            // Bus deliveries for this connection's session.
            Some(message) = outbound_rx.recv() => {
                if send_message(&mut ws_tx, &message).await.is_err() {
                    break Exit::ClientGone;
                }
            }

            _ = &mut handshake_deadline, if !conn.is_active() => {
                let _ = send_close(&mut ws_tx, CLOSE_POLICY_VIOLATION, "handshake timeout").await;
                break Exit::ServerClosed(CLOSE_POLICY_VIOLATION);
            }

            _ = shutdown_requested(&mut shutdown) => {
                let _ = send_close(&mut ws_tx, CLOSE_GOING_AWAY, "server shutting down").await;
                break Exit::Shutdown;
            }
        }
    };

    conn.close().await;

    let connection_id = conn.connection_id();
    match exit {
        Exit::ClientGone => tracing::info!(%connection_id, "relay connection closed by client"),
        Exit::ServerClosed(code) => {
            tracing::info!(%connection_id, close_code = code, "relay connection closed by server")
        }
        Exit::Shutdown => tracing::info!(%connection_id, "relay connection closed for shutdown"),
    }
}

/// Resolves once shutdown has begun, including when it began before this
/// connection subscribed.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let sender_gone = shutdown.wait_for(|down| *down).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

async fn next_inbound(ws_rx: &mut SplitStream<WebSocket>) -> Inbound {
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => return Inbound::Text(text.as_str().to_owned()),
            Ok(Message::Binary(_)) => return Inbound::Binary,
            Ok(Message::Close(_)) => return Inbound::Gone,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(e) => {
                tracing::debug!(?e, "ws read error");
                return Inbound::Gone;
            }
        }
    }
    Inbound::Gone
}

async fn send_message(ws_tx: &mut WsSink, message: &ServerMessage) -> Result<(), axum::Error> {
    let json = match message.to_json() {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(%err, "failed to encode server message");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
