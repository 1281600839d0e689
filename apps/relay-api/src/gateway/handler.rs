//! Per-operation effects for an active relay connection: handshake
//! registration, presence queries and broadcast publishing.

use serde_json::Value;

use crate::error::ApiError;
use crate::models::connection::ConnectionRecord;
use crate::AppState;

use super::bus::BusMessage;
use super::events::{BroadcastPayload, ServerMessage};
use super::presence::{collect_presence, RefreshTask};
use super::registry::LocalConnection;

/// Identity a connection establishes with its `hello`.
#[derive(Debug, Clone)]
pub struct Identity {
    pub connection_id: String,
    pub session_id: String,
    pub user_type: String,
    pub client_type: String,
}

/// Register a connection that completed its handshake: write presence, join
/// the local registry, start the refresh activity.
///
/// Store failures are logged and tolerated; the refresh activity re-creates
/// the record on its next cycle. A bus subscribe failure is returned after
/// undoing the store writes.
pub async fn handle_hello(
    state: &AppState,
    identity: &Identity,
    outbound: tokio::sync::mpsc::Sender<ServerMessage>,
) -> Result<(ServerMessage, RefreshTask), ApiError> {
    let config = &state.config;
    let record = ConnectionRecord::new(
        &identity.session_id,
        &identity.user_type,
        &identity.client_type,
        relay_common::clock::unix_now(),
    );

    if let Err(err) = state
        .store
        .put_record(&identity.connection_id, &record, config.presence_ttl_secs)
        .await
    {
        tracing::warn!(connection_id = %identity.connection_id, %err, "presence record write failed");
    }
    if let Err(err) = state
        .store
        .add_member(&identity.session_id, &identity.connection_id)
        .await
    {
        tracing::warn!(connection_id = %identity.connection_id, %err, "membership write failed");
    }

    let local = LocalConnection {
        connection_id: identity.connection_id.clone(),
        session_id: identity.session_id.clone(),
        user_type: identity.user_type.clone(),
        client_type: identity.client_type.clone(),
        outbound,
    };
    if let Err(err) = state.registry.join(local).await {
        tracing::error!(
            connection_id = %identity.connection_id,
            session_id = %identity.session_id,
            %err,
            "session subscribe failed"
        );
        release_presence(state, &identity.connection_id, &identity.session_id).await;
        return Err(err);
    }

    let refresh = RefreshTask::spawn(
        state.store.clone(),
        identity.connection_id.clone(),
        record,
        config.presence_ttl_secs,
        config.presence_refresh_interval(),
    );

    Ok((
        ServerMessage::connected(&identity.session_id, &identity.connection_id),
        refresh,
    ))
}

/// Answer a `presence` query. Store failures become an inline error.
pub async fn handle_presence(state: &AppState, identity: &Identity) -> ServerMessage {
    match collect_presence(state.store.as_ref(), &identity.session_id).await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::warn!(session_id = %identity.session_id, %err, "presence query failed");
            ServerMessage::error("presence unavailable")
        }
    }
}

/// Publish a `broadcast` to the session topic. The sender receives its copy
/// through the bus like everyone else, so success has no direct reply.
pub async fn handle_broadcast(
    state: &AppState,
    identity: &Identity,
    payload: BroadcastPayload,
) -> Option<ServerMessage> {
    let message = BusMessage {
        session_id: identity.session_id.clone(),
        sender: identity.connection_id.clone(),
        user_type: identity.user_type.clone(),
        client_type: identity.client_type.clone(),
        msg: payload.msg,
        data: payload.data,
    };
    let topic = state.registry.topic(&identity.session_id);

    match state.registry.bus().publish(&topic, &message).await {
        Ok(()) => None,
        Err(err) => {
            tracing::warn!(
                connection_id = %identity.connection_id,
                %topic,
                %err,
                "broadcast publish failed"
            );
            Some(ServerMessage::error("broadcast failed"))
        }
    }
}

pub fn handle_echo(frame: Value) -> ServerMessage {
    ServerMessage::Echo { data: frame }
}

/// Leave the local registry and drop presence for a closing connection.
pub async fn release(state: &AppState, connection_id: &str, session_id: &str) {
    state.registry.leave(connection_id).await;
    release_presence(state, connection_id, session_id).await;
}

async fn release_presence(state: &AppState, connection_id: &str, session_id: &str) {
    if let Err(err) = state.store.remove_member(session_id, connection_id).await {
        tracing::warn!(%connection_id, %session_id, %err, "membership removal failed");
    }
    if let Err(err) = state.store.delete_record(connection_id).await {
        tracing::warn!(%connection_id, %err, "presence record delete failed");
    }
}
