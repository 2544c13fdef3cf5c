//! Shared data models for room and direct conversations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

// --- Conversations ---

/// Discriminates group rooms from one-to-one threads.
///
/// Both kinds travel over the same `room:*` events; the kind only keeps two
/// conversations that happen to share an id string apart.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum ConversationKind {
    #[default]
    Room,
    Direct,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Room => "room",
            ConversationKind::Direct => "direct",
        }
    }
}

/// Key used by the tracker, the message store and the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId {
    pub kind: ConversationKind,
    pub id: String,
}

impl ConversationId {
    pub fn new(kind: ConversationKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn room(id: impl Into<String>) -> Self {
        Self::new(ConversationKind::Room, id)
    }

    pub fn direct(id: impl Into<String>) -> Self {
        Self::new(ConversationKind::Direct, id)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self::room(id)
    }
}

// --- Messaging ---

/// The atomic unit of a feed.
///
/// `id` is generated by the sender before the message reaches the wire and is
/// kept by the relay, so an echo carries the same id as the optimistic copy.
/// `created_at` is milliseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    #[serde(default)]
    pub conversation_kind: ConversationKind,
    pub author_id: String,
    pub text: String,
    pub created_at: i64,
}

impl Message {
    pub fn conversation(&self) -> ConversationId {
        ConversationId::new(self.conversation_kind, self.room_id.clone())
    }

    pub fn belongs_to(&self, conversation: &ConversationId) -> bool {
        self.conversation_kind == conversation.kind && self.room_id == conversation.id
    }

    /// Rejects payloads that decoded but cannot be keyed.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.id.trim().is_empty() || self.room_id.trim().is_empty() {
            return Err(ProtocolError::IncompleteMessage {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
