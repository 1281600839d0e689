//! Per-connection protocol state machine.
//!
//! A [`RelayConnection`] starts in `AwaitingHandshake`, moves to `Active` on
//! a valid `hello`, and ends in `Closed`. The transport loop feeds it frames
//! and acts on the returned [`Step`].

use tokio::sync::mpsc;

use crate::models::connection::DEFAULT_CLIENT_TYPE;
use crate::AppState;

use super::events::{ClientMessage, FrameError, ServerMessage};
use super::handler::{self, Identity};
use super::presence::RefreshTask;

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// What the transport should do after a frame was handled.
#[derive(Debug, PartialEq)]
pub enum Step {
    Reply(ServerMessage),
    /// Nothing to send back directly.
    Silent,
    /// Send `reply` if present, then close with `code`.
    Close {
        reply: Option<ServerMessage>,
        code: u16,
        reason: &'static str,
    },
}

enum Phase {
    AwaitingHandshake,
    Active(ActiveSession),
    Closed,
}

struct ActiveSession {
    identity: Identity,
    refresh: RefreshTask,
}

pub struct RelayConnection {
    state: AppState,
    connection_id: String,
    session_id: String,
    outbound: mpsc::Sender<ServerMessage>,
    phase: Phase,
    malformed_streak: u32,
}

impl RelayConnection {
    pub fn new(
        state: AppState,
        connection_id: String,
        session_id: String,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            state,
            connection_id,
            session_id,
            outbound,
            phase: Phase::AwaitingHandshake,
            malformed_streak: 0,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Active(_))
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) -> Step {
        match self.phase {
            Phase::Closed => Step::Silent,
            Phase::AwaitingHandshake => self.handshake(ClientMessage::parse(text)).await,
            Phase::Active(_) => match ClientMessage::parse(text) {
                Ok(message) => {
                    self.malformed_streak = 0;
                    self.dispatch(message).await
                }
                Err(err) => self.malformed(err.message()),
            },
        }
    }

    /// Binary frames carry no protocol meaning and count as malformed.
    pub async fn handle_binary(&mut self) -> Step {
        match self.phase {
            Phase::Closed => Step::Silent,
            Phase::AwaitingHandshake => {
                self.handshake(Err(FrameError::InvalidPayload("binary frames are not supported")))
                    .await
            }
            Phase::Active(_) => self.malformed("binary frames are not supported"),
        }
    }

    async fn handshake(&mut self, parsed: Result<ClientMessage, FrameError>) -> Step {
        let hello = match parsed {
            Ok(ClientMessage::Hello(hello)) => hello,
            Ok(_) => return reject_handshake("hello required before any other message"),
            Err(err) => return reject_handshake(err.message()),
        };
        let Some(user_type) = hello.user_type() else {
            return reject_handshake("user_type is required");
        };

        let identity = Identity {
            connection_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
            user_type: user_type.to_string(),
            client_type: hello.client_type().unwrap_or(DEFAULT_CLIENT_TYPE).to_string(),
        };

        match handler::handle_hello(&self.state, &identity, self.outbound.clone()).await {
            Ok((reply, refresh)) => {
                tracing::info!(
                    connection_id = %identity.connection_id,
                    session_id = %identity.session_id,
                    user_type = %identity.user_type,
                    client_type = %identity.client_type,
                    "relay handshake completed"
                );
                self.phase = Phase::Active(ActiveSession { identity, refresh });
                Step::Reply(reply)
            }
            Err(_) => {
                self.phase = Phase::Closed;
                Step::Close {
                    reply: Some(ServerMessage::error("session unavailable")),
                    code: CLOSE_INTERNAL_ERROR,
                    reason: "session unavailable",
                }
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Step {
        let Phase::Active(active) = &self.phase else {
            return Step::Silent;
        };
        let identity = &active.identity;

        match message {
            ClientMessage::Hello(_) => Step::Reply(ServerMessage::error("handshake already completed")),
            ClientMessage::Presence => Step::Reply(handler::handle_presence(&self.state, identity).await),
            ClientMessage::Broadcast(payload) => {
                match handler::handle_broadcast(&self.state, identity, payload).await {
                    Some(reply) => Step::Reply(reply),
                    None => Step::Silent,
                }
            }
            ClientMessage::Other(frame) => Step::Reply(handler::handle_echo(frame)),
        }
    }

    fn malformed(&mut self, message: &str) -> Step {
        self.malformed_streak = self.malformed_streak.saturating_add(1);
        let limit = self.state.config.max_malformed_frames;
        // A limit of zero disables the cutoff.
        if limit > 0 && self.malformed_streak >= limit {
            tracing::info!(
                connection_id = %self.connection_id,
                streak = self.malformed_streak,
                "closing connection after repeated malformed frames"
            );
            return Step::Close {
                reply: Some(ServerMessage::error(message)),
                code: CLOSE_POLICY_VIOLATION,
                reason: "too many malformed frames",
            };
        }
        Step::Reply(ServerMessage::error(message))
    }

    /// Stop refreshing, leave the registry, and remove presence. Safe to call
    /// more than once.
    pub async fn close(&mut self) {
        let phase = std::mem::replace(&mut self.phase, Phase::Closed);
        if let Phase::Active(active) = phase {
            active.refresh.stop().await;
            handler::release(&self.state, &self.connection_id, &self.session_id).await;
            tracing::info!(
                connection_id = %self.connection_id,
                session_id = %self.session_id,
                "relay connection released"
            );
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        let Phase::Active(active) = std::mem::replace(&mut self.phase, Phase::Closed) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(connection_id = %self.connection_id, "no runtime for cleanup, presence left to expire");
            return;
        };
        let state = self.state.clone();
        let connection_id = self.connection_id.clone();
        let session_id = self.session_id.clone();
        runtime.spawn(async move {
            active.refresh.stop().await;
            handler::release(&state, &connection_id, &session_id).await;
            tracing::debug!(%connection_id, "relay connection released from drop");
        });
    }
}

fn reject_handshake(message: &str) -> Step {
    Step::Close {
        reply: Some(ServerMessage::error(message)),
        code: CLOSE_POLICY_VIOLATION,
        reason: "handshake required",
    }
}
