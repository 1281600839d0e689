//! Relay wire-format messages. Every frame is one JSON object with a `type`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Hello(HelloPayload),
    Presence,
    Broadcast(BroadcastPayload),
    /// Any other `type`; echoed back verbatim.
    Other(Value),
}

/// Identity fields of a `hello`, trimmed. Blank or non-string values are
/// treated as absent.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloPayload {
    pub user_type: Option<String>,
    pub client_type: Option<String>,
}

impl HelloPayload {
    /// `user_type` falls back to `from`, the legacy spelling still sent by
    /// older clients. Either may be present; the first non-blank string wins.
    pub fn from_object(map: &Map<String, Value>) -> Self {
        Self {
            user_type: non_blank(map, "user_type").or_else(|| non_blank(map, "from")),
            client_type: non_blank(map, "client_type"),
        }
    }

    pub fn user_type(&self) -> Option<&str> {
        self.user_type.as_deref()
    }

    pub fn client_type(&self) -> Option<&str> {
        self.client_type.as_deref()
    }
}

fn non_blank(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BroadcastPayload {
    #[serde(default)]
    pub msg: Value,
    #[serde(default)]
    pub data: Value,
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    InvalidJson,
    NotAnObject,
    MissingType,
    InvalidPayload(&'static str),
}

impl FrameError {
    pub fn message(&self) -> &'static str {
        match self {
            FrameError::InvalidJson => "invalid_json",
            FrameError::NotAnObject => "frame must be a JSON object",
            FrameError::MissingType => "missing type",
            FrameError::InvalidPayload(reason) => reason,
        }
    }
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|_| FrameError::InvalidJson)?;
        let Value::Object(map) = &value else {
            return Err(FrameError::NotAnObject);
        };
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?
            .to_string();

        match kind.as_str() {
            "hello" => Ok(ClientMessage::Hello(HelloPayload::from_object(map))),
            "presence" => Ok(ClientMessage::Presence),
            "broadcast" => serde_json::from_value(value)
                .map(ClientMessage::Broadcast)
                .map_err(|_| FrameError::InvalidPayload("invalid broadcast payload")),
            _ => Ok(ClientMessage::Other(value)),
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// One member row in a `presence` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMember {
    pub connection_id: String,
    pub user_type: String,
    pub client_type: String,
    pub connected_at: i64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: String,
        connection_id: String,
        user_type_required: bool,
    },
    Presence {
        session_id: String,
        count: usize,
        by_type: BTreeMap<String, usize>,
        members: Vec<PresenceMember>,
    },
    SessionMessage {
        user_type: String,
        client_type: String,
        msg: Value,
        data: Value,
    },
    Echo {
        data: Value,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn connected(session_id: &str, connection_id: &str) -> Self {
        Self::Connected {
            session_id: session_id.to_string(),
            connection_id: connection_id.to_string(),
            user_type_required: true,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_hello_with_legacy_from_alias() {
        let msg = ClientMessage::parse(r#"{"type":"hello","from":" admin ","client_type":"web"}"#).unwrap();
        match msg {
            ClientMessage::Hello(h) => {
                assert_eq!(h.user_type(), Some("admin"));
                assert_eq!(h.client_type(), Some("web"));
            }
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn parse_hello_blank_user_type_is_none() {
        let msg = ClientMessage::parse(r#"{"type":"hello","user_type":"   "}"#).unwrap();
        match msg {
            ClientMessage::Hello(h) => assert!(h.user_type().is_none()),
            other => panic!("expected hello, got {other:?}"),
        }
    }

    fn hello(text: &str) -> HelloPayload {
        match ClientMessage::parse(text).unwrap() {
            ClientMessage::Hello(h) => h,
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn parse_hello_non_string_user_type_is_absent() {
        assert!(hello(r#"{"type":"hello","user_type":42}"#).user_type().is_none());
    }

    #[test]
    fn parse_hello_accepts_user_type_and_from_together() {
        let h = hello(r#"{"type":"hello","user_type":"admin","from":"guest"}"#);
        assert_eq!(h.user_type(), Some("admin"));
    }

    #[test]
    fn parse_hello_blank_user_type_falls_back_to_from() {
        let h = hello(r#"{"type":"hello","user_type":"","from":"guest"}"#);
        assert_eq!(h.user_type(), Some("guest"));

        let h = hello(r#"{"type":"hello","user_type":null,"from":" guest "}"#);
        assert_eq!(h.user_type(), Some("guest"));
    }

    #[test]
    fn parse_hello_ignores_non_string_client_type() {
        let h = hello(r#"{"type":"hello","user_type":"admin","client_type":5}"#);
        assert_eq!(h.user_type(), Some("admin"));
        assert!(h.client_type().is_none());
    }

    #[test]
    fn parse_rejects_malformed_frames() {
        assert_eq!(ClientMessage::parse("{not json").unwrap_err(), FrameError::InvalidJson);
        assert_eq!(ClientMessage::parse("[1,2]").unwrap_err(), FrameError::NotAnObject);
        assert_eq!(ClientMessage::parse(r#"{"msg":"hi"}"#).unwrap_err(), FrameError::MissingType);
        assert_eq!(ClientMessage::parse(r#"{"type":7}"#).unwrap_err(), FrameError::MissingType);
    }

    #[test]
    fn parse_broadcast_defaults_to_null() {
        let msg = ClientMessage::parse(r#"{"type":"broadcast","msg":"hi","extra":true}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Broadcast(BroadcastPayload {
                msg: json!("hi"),
                data: Value::Null,
            })
        );
    }

    #[test]
    fn unknown_types_keep_the_whole_object() {
        let msg = ClientMessage::parse(r#"{"type":"ping","n":1}"#).unwrap();
        assert_eq!(msg, ClientMessage::Other(json!({"type": "ping", "n": 1})));
    }

    #[test]
    fn server_messages_are_tagged_by_type() {
        let connected = serde_json::to_value(ServerMessage::connected("room-1", "con_1")).unwrap();
        assert_eq!(
            connected,
            json!({
                "type": "connected",
                "session_id": "room-1",
                "connection_id": "con_1",
                "user_type_required": true
            })
        );

        let delivery = serde_json::to_value(ServerMessage::SessionMessage {
            user_type: "admin".to_string(),
            client_type: "web".to_string(),
            msg: json!("hi"),
            data: Value::Null,
        })
        .unwrap();
        assert_eq!(delivery["type"], "session_message");
        assert!(delivery["data"].is_null());

        let error = serde_json::to_value(ServerMessage::error("invalid_json")).unwrap();
        assert_eq!(error, json!({"type": "error", "message": "invalid_json"}));
    }
}
