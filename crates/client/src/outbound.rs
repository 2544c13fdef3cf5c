//! Outbound send queue.
//!
//! Every message gets its id here, before it reaches the wire, so the echo
//! can be deduplicated by id in the message store. The queue never waits for
//! acknowledgement, never buffers and never writes to the store.

use roomfeed_shared::{now_millis, ClientCommand, ConversationId, Message};

use crate::error::RoomFeedError;
use crate::ws::CommandSink;

#[derive(Debug, Clone)]
pub struct SendQueue {
    author_id: String,
}

impl SendQueue {
    pub fn new(author_id: impl Into<String>) -> Self {
        Self {
            author_id: author_id.into(),
        }
    }

    /// Build a message with a fresh id and the local clock.
    pub fn stamp(&self, room: &ConversationId, text: &str) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room.id.clone(),
            conversation_kind: room.kind,
            author_id: self.author_id.clone(),
            text: text.to_string(),
            created_at: now_millis(),
        }
    }

    /// Stamp and transmit. Fails fast with
    /// [`RoomFeedError::TransportUnavailable`] when not connected.
    pub fn send(
        &self,
        room: &ConversationId,
        text: &str,
        sink: &dyn CommandSink,
    ) -> Result<Message, RoomFeedError> {
        if text.trim().is_empty() {
            return Err(RoomFeedError::EmptyMessage);
        }
        if sink.connection_generation().is_none() {
            return Err(RoomFeedError::TransportUnavailable);
        }

        let message = self.stamp(room, text);
        sink.transmit(ClientCommand::send(&message))?;
        crate::log_debug!("outbound: sent {} to {}", message.id, room);
        Ok(message)
    }
}
