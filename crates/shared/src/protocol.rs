//! Wire protocol for room messaging.
//!
//! Every frame is a JSON [`WsEnvelope`] whose payload is adjacently tagged:
//!
//! ```text
//! {"id":"…","type":"room:join","data":{"roomId":"lobby","conversationKind":"room"},"ts":"…"}
//! ```

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;
use crate::models::{ConversationId, ConversationKind, Message};

/// Scheme used in the `Authorization` header of the WebSocket upgrade.
pub const BEARER_SCHEME: &str = "Bearer";

/// Error codes carried by [`ServerEvent::Error`].
pub const ERROR_BAD_REQUEST: &str = "BAD_REQUEST";
pub const ERROR_NOT_JOINED: &str = "NOT_JOINED";

/// Build the `Authorization` header value for an opaque session token.
pub fn bearer_header_value(token: &str) -> String {
    format!("{} {}", BEARER_SCHEME, token)
}

/// Extract the token from an `Authorization` header value.
pub fn parse_bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case(BEARER_SCHEME) {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> WsEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }

    /// Envelope answering the frame identified by `correlation_id`.
    pub fn reply(payload: T, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::new(payload)
        }
    }
}

impl<T: Serialize> WsEnvelope<T> {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: DeserializeOwned> WsEnvelope<T> {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    #[serde(rename = "room:join")]
    Join {
        room_id: String,
        #[serde(default)]
        conversation_kind: ConversationKind,
    },
    #[serde(rename = "room:leave")]
    Leave {
        room_id: String,
        #[serde(default)]
        conversation_kind: ConversationKind,
    },
    #[serde(rename = "room:send")]
    Send {
        id: String,
        room_id: String,
        #[serde(default)]
        conversation_kind: ConversationKind,
        text: String,
    },
    /// `epoch` is echoed back on the matching `room:recent`.
    #[serde(rename = "room:fetchRecent")]
    FetchRecent {
        room_id: String,
        #[serde(default)]
        conversation_kind: ConversationKind,
        epoch: u64,
    },
}

impl ClientCommand {
    pub fn join(conversation: &ConversationId) -> Self {
        ClientCommand::Join {
            room_id: conversation.id.clone(),
            conversation_kind: conversation.kind,
        }
    }

    pub fn leave(conversation: &ConversationId) -> Self {
        ClientCommand::Leave {
            room_id: conversation.id.clone(),
            conversation_kind: conversation.kind,
        }
    }

    pub fn fetch_recent(conversation: &ConversationId, epoch: u64) -> Self {
        ClientCommand::FetchRecent {
            room_id: conversation.id.clone(),
            conversation_kind: conversation.kind,
            epoch,
        }
    }

    pub fn send(message: &Message) -> Self {
        ClientCommand::Send {
            id: message.id.clone(),
            room_id: message.room_id.clone(),
            conversation_kind: message.conversation_kind,
            text: message.text.clone(),
        }
    }

    pub fn conversation(&self) -> ConversationId {
        match self {
            ClientCommand::Join {
                room_id,
                conversation_kind,
            }
            | ClientCommand::Leave {
                room_id,
                conversation_kind,
            }
            | ClientCommand::Send {
                room_id,
                conversation_kind,
                ..
            }
            | ClientCommand::FetchRecent {
                room_id,
                conversation_kind,
                ..
            } => ConversationId::new(*conversation_kind, room_id.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A live push, including the echo of the session's own sends.
    #[serde(rename = "room:message")]
    Message(Message),
    /// Bulk history answering a `room:fetchRecent`.
    #[serde(rename = "room:recent")]
    Recent {
        room_id: String,
        #[serde(default)]
        conversation_kind: ConversationKind,
        #[serde(default)]
        epoch: Option<u64>,
        /// Entries that do not decode as a [`Message`] are skipped, so one bad
        /// entry cannot cost the whole batch.
        #[serde(deserialize_with = "skip_malformed")]
        messages: Vec<Message>,
    },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerEvent {
    /// The conversation an event is addressed to, if any.
    pub fn conversation(&self) -> Option<ConversationId> {
        match self {
            ServerEvent::Message(message) => Some(message.conversation()),
            ServerEvent::Recent {
                room_id,
                conversation_kind,
                ..
            } => Some(ConversationId::new(*conversation_kind, room_id.clone())),
            ServerEvent::Error { .. } => None,
        }
    }
}

fn skip_malformed<'de, D>(deserializer: D) -> Result<Vec<Message>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect())
}
