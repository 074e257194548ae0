//! JSON frames exchanged over the autoupdate WebSocket.
//!
//! ```text
//! client → {"type":"connect","token":"…","change_id":0}
//! server → {"type":"autoupdate","changed":{...},"deleted":[...],
//!           "from_change_id":0,"to_change_id":12,"all_data":true}
//! client → {"type":"ping"}
//! server → {"type":"pong"}
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::autoupdate::AutoupdateMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame of every connection. `token` identifies the user (none
    /// for anonymous); `change_id` is the last change id the client has
    /// seen, 0 for none.
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default)]
        change_id: u64,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Autoupdate(Arc<AutoupdateMessage>),
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("expected a connect frame first")]
    NotConnected,

    #[error("unsupported frame type")]
    Unsupported,
}

pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_server(message: &ServerMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode_server(text: &str) -> Result<ServerMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_client(message: &ClientMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementId;
    use serde_json::{json, Value};

    #[test]
    fn test_decode_connect_and_ping() {
        assert_eq!(
            decode_client(r#"{"type":"connect","token":"abc","change_id":12}"#).unwrap(),
            ClientMessage::Connect {
                token: Some("abc".to_string()),
                change_id: 12
            }
        );
        // A claimed user id carries no weight.
        assert_eq!(
            decode_client(r#"{"type":"connect","user_id":7}"#).unwrap(),
            ClientMessage::Connect {
                token: None,
                change_id: 0
            }
        );
        assert_eq!(decode_client(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_client("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            decode_client(r#"{"type":"subscribe"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_autoupdate_frame_is_flat() {
        let message = AutoupdateMessage {
            deleted: vec![ElementId::new("core/tag", 1).unwrap()],
            from_change_id: 1,
            to_change_id: 2,
            ..AutoupdateMessage::default()
        };
        let text = encode_server(&ServerMessage::Autoupdate(Arc::new(message))).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "autoupdate",
                "changed": {},
                "deleted": ["core/tag:1"],
                "from_change_id": 1,
                "to_change_id": 2,
                "all_data": false
            })
        );
    }

    #[test]
    fn test_error_frame() {
        let text = encode_server(&ServerMessage::error("nope")).unwrap();
        assert_eq!(text, r#"{"type":"error","message":"nope"}"#);
        assert_eq!(encode_server(&ServerMessage::Pong).unwrap(), r#"{"type":"pong"}"#);
    }
}
