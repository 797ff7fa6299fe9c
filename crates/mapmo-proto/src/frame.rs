use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{ConversationId, ServerMessageId, UserId};

/// Frame tags understood on the socket.
pub mod tags {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const TYPING: &str = "typing";
    /// Tag the server uses when relaying a partner's typing flag.
    pub const TYPING_STATUS: &str = "typing_status";
    pub const MATCH_FOUND: &str = "match_found";
    pub const KEEP_STATUS: &str = "keep_status";
    pub const CONVERSATION_ENDED: &str = "conversation_ended";
    pub const COUNTDOWN_UPDATE: &str = "countdown_update";
}

/// Raw `{ "type": ..., "data": ... }` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not a valid envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode `{kind}` frame: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

fn default_message_type() -> String {
    "text".to_string()
}

/// Authoritative chat message as persisted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: ServerMessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default, with = "crate::time::option")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingStatus {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedUser {
    pub id: UserId,
    #[serde(default)]
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFound {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub conversation_type: Option<String>,
    #[serde(default)]
    pub chat_url: Option<String>,
    #[serde(default)]
    pub matched_user: Option<MatchedUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepStatus {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub keep_status: bool,
    #[serde(default)]
    pub both_kept: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEnded {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub ended_by: Option<UserId>,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Server-authoritative countdown block. Delivered both as a
/// `countdown_update` frame and by the REST countdown endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountdownState {
    #[serde(default)]
    pub time_left: Option<i64>,
    #[serde(default, with = "crate::time::option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub both_kept: bool,
    #[serde(default)]
    pub expired: bool,
}

/// Frames the server pushes to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Ping,
    ChatMessage(ChatMessage),
    Typing(TypingStatus),
    MatchFound(MatchFound),
    KeepStatus(KeepStatus),
    ConversationEnded(ConversationEnded),
    CountdownUpdate(CountdownState),
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Ping => tags::PING,
            ServerFrame::ChatMessage(_) => tags::CHAT_MESSAGE,
            ServerFrame::Typing(_) => tags::TYPING,
            ServerFrame::MatchFound(_) => tags::MATCH_FOUND,
            ServerFrame::KeepStatus(_) => tags::KEEP_STATUS,
            ServerFrame::ConversationEnded(_) => tags::CONVERSATION_ENDED,
            ServerFrame::CountdownUpdate(_) => tags::COUNTDOWN_UPDATE,
        }
    }
}

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(ServerFrame),
    /// Well-formed envelope with a tag this client does not know.
    Unknown { kind: String },
}

pub fn decode(text: &str) -> Result<Decoded, FrameError> {
    let Envelope { kind, data } = serde_json::from_str(text).map_err(FrameError::Envelope)?;
    let frame = match kind.as_str() {
        tags::PING => ServerFrame::Ping,
        tags::CHAT_MESSAGE => ServerFrame::ChatMessage(payload(&kind, data)?),
        tags::TYPING | tags::TYPING_STATUS => ServerFrame::Typing(payload(&kind, data)?),
        tags::MATCH_FOUND => ServerFrame::MatchFound(payload(&kind, data)?),
        tags::KEEP_STATUS => ServerFrame::KeepStatus(payload(&kind, data)?),
        tags::CONVERSATION_ENDED => ServerFrame::ConversationEnded(payload(&kind, data)?),
        tags::COUNTDOWN_UPDATE => ServerFrame::CountdownUpdate(payload(&kind, data)?),
        _ => return Ok(Decoded::Unknown { kind }),
    };
    Ok(Decoded::Frame(frame))
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, FrameError> {
    // Some server paths omit `data` on notifications that carry no fields.
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|source| FrameError::Payload {
        kind: kind.to_string(),
        source,
    })
}

/// Frames the client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    Pong {},
    ChatMessage {
        conversation_id: ConversationId,
        content: String,
        message_type: String,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
}

impl ClientFrame {
    pub fn pong() -> Self {
        ClientFrame::Pong {}
    }

    pub fn chat(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        ClientFrame::ChatMessage {
            conversation_id,
            content: content.into(),
            message_type: default_message_type(),
        }
    }

    pub fn typing(conversation_id: ConversationId, is_typing: bool) -> Self {
        ClientFrame::Typing {
            conversation_id,
            is_typing,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Pong {} => tags::PONG,
            ClientFrame::ChatMessage { .. } => tags::CHAT_MESSAGE,
            ClientFrame::Typing { .. } => tags::TYPING,
        }
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(|source| FrameError::Encode {
            kind: self.kind(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_frame(value: Value) -> ServerFrame {
        match decode(&value.to_string()).expect("decode") {
            Decoded::Frame(frame) => frame,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn decodes_chat_message_with_naive_timestamp() {
        let frame = decode_frame(json!({
            "type": "chat_message",
            "data": {
                "id": 41,
                "conversation_id": 7,
                "sender_id": 3,
                "content": "hi",
                "message_type": "text",
                "created_at": "2024-05-01T10:00:00.123456"
            }
        }));
        let ServerFrame::ChatMessage(message) = frame else {
            panic!("wrong variant");
        };
        assert_eq!(message.id, 41);
        assert_eq!(message.sender_id, 3);
        assert_eq!(message.content, "hi");
        assert!(message.created_at.is_some());
    }

    #[test]
    fn typing_status_tag_is_an_alias() {
        let a = decode_frame(json!({"type": "typing", "data": {"is_typing": true}}));
        let b = decode_frame(json!({
            "type": "typing_status",
            "data": {"conversation_id": 7, "user_id": 2, "is_typing": true}
        }));
        for frame in [a, b] {
            let ServerFrame::Typing(status) = frame else {
                panic!("wrong variant");
            };
            assert!(status.is_typing);
        }
    }

    #[test]
    fn ping_without_data_decodes() {
        assert_eq!(decode_frame(json!({"type": "ping"})), ServerFrame::Ping);
    }

    #[test]
    fn countdown_update_fields() {
        let frame = decode_frame(json!({
            "type": "countdown_update",
            "data": {
                "time_left": 42,
                "start_time": "2024-05-01T10:00:00+00:00",
                "both_kept": false,
                "expired": false
            }
        }));
        let ServerFrame::CountdownUpdate(state) = frame else {
            panic!("wrong variant");
        };
        assert_eq!(state.time_left, Some(42));
        assert!(state.start_time.is_some());
        assert!(!state.expired);
    }

    #[test]
    fn conversation_ended_without_reason() {
        let frame = decode_frame(json!({
            "type": "conversation_ended",
            "data": {"conversation_id": 7, "ended_by": 2, "redirect_url": "/"}
        }));
        let ServerFrame::ConversationEnded(ended) = frame else {
            panic!("wrong variant");
        };
        assert_eq!(ended.redirect_url.as_deref(), Some("/"));
        assert_eq!(ended.reason, None);
    }

    #[test]
    fn unknown_tags_are_reported_not_rejected() {
        let decoded = decode(r#"{"type":"voice_offer","data":{"sdp":"..."}}"#).unwrap();
        assert_eq!(
            decoded,
            Decoded::Unknown {
                kind: "voice_offer".into()
            }
        );
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(matches!(decode("not json"), Err(FrameError::Envelope(_))));
        assert!(matches!(
            decode(r#"{"data":{}}"#),
            Err(FrameError::Envelope(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"chat_message","data":{"content":"x"}}"#),
            Err(FrameError::Payload { .. })
        ));
    }

    #[test]
    fn client_frames_use_type_and_data() {
        let chat: Value =
            serde_json::from_str(&ClientFrame::chat(7, "hello").encode().unwrap()).unwrap();
        assert_eq!(
            chat,
            json!({
                "type": "chat_message",
                "data": {"conversation_id": 7, "content": "hello", "message_type": "text"}
            })
        );

        let typing: Value =
            serde_json::from_str(&ClientFrame::typing(7, false).encode().unwrap()).unwrap();
        assert_eq!(typing["type"], "typing");
        assert_eq!(typing["data"]["is_typing"], false);

        let pong: Value = serde_json::from_str(&ClientFrame::pong().encode().unwrap()).unwrap();
        assert_eq!(pong, json!({"type": "pong", "data": {}}));
    }
}
