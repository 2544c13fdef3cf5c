//! Per-conversation message logs.
//!
//! Each log is kept sorted by `created_at` ascending and never holds two
//! messages with the same id. Messages with equal timestamps stay in arrival
//! order. Every mutation reports whether the visible log changed so callers
//! only notify the UI when something actually happened.

use std::collections::{HashMap, HashSet};

use roomfeed_shared::{ConversationId, Message};

/// Messages for a single conversation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoomLog {
    /// Sorted by created_at ascending, ties in arrival order.
    messages: Vec<Message>,
    seen: HashSet<String>,
    /// Ids inserted locally that the server has not confirmed yet.
    pending: HashSet<String>,
    /// Whether a history fetch has been merged.
    is_loaded: bool,
}

impl RoomLog {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    fn insert_sorted(&mut self, msg: Message) {
        let pos = self
            .messages
            .partition_point(|m| m.created_at <= msg.created_at);
        self.messages.insert(pos, msg);
    }

    fn apply(&mut self, msg: Message) -> bool {
        // A server copy of an optimistic message replaces it and takes the
        // server's timestamp, which may move it.
        if self.pending.remove(&msg.id) {
            if let Some(pos) = self.messages.iter().position(|m| m.id == msg.id) {
                self.messages.remove(pos);
            }
            self.insert_sorted(msg);
            return true;
        }

        if !self.seen.insert(msg.id.clone()) {
            return false;
        }
        self.insert_sorted(msg);
        true
    }

    fn insert_local(&mut self, msg: Message) -> bool {
        if !self.seen.insert(msg.id.clone()) {
            return false;
        }
        self.pending.insert(msg.id.clone());
        self.insert_sorted(msg);
        true
    }

    fn merge_history(&mut self, history: Vec<Message>) -> bool {
        let was_loaded = self.is_loaded;
        self.is_loaded = true;

        let mut order = Vec::with_capacity(history.len());
        let mut by_id: HashMap<String, Message> = HashMap::with_capacity(history.len());
        for msg in history {
            if by_id.contains_key(&msg.id) {
                continue;
            }
            order.push(msg.id.clone());
            by_id.insert(msg.id.clone(), msg);
        }

        let previous = std::mem::take(&mut self.messages);
        let mut merged = Vec::with_capacity(previous.len() + by_id.len());

        // Entries already in the log keep their arrival position; the history
        // copy wins where both exist.
        for existing in previous.iter() {
            match by_id.remove(&existing.id) {
                Some(server_copy) => {
                    self.pending.remove(&existing.id);
                    merged.push(server_copy);
                }
                None => merged.push(existing.clone()),
            }
        }
        for id in order {
            if let Some(msg) = by_id.remove(&id) {
                self.seen.insert(id);
                merged.push(msg);
            }
        }

        merged.sort_by_key(|m| m.created_at);
        let changed = !was_loaded || merged != previous;
        self.messages = merged;
        changed
    }
}

/// Message logs keyed by conversation.
#[derive(Debug, Default)]
pub struct MessageStore {
    rooms: HashMap<ConversationId, RoomLog>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or refresh a log from a history fetch. Messages addressed to
    /// another conversation or missing an id are skipped.
    pub fn merge_history(&mut self, room: &ConversationId, messages: Vec<Message>) -> bool {
        let accepted: Vec<Message> = messages
            .into_iter()
            .filter(|m| accepts(room, m))
            .collect();
        self.rooms
            .entry(room.clone())
            .or_default()
            .merge_history(accepted)
    }

    /// Merge one pushed message. Returns `false` and leaves the store
    /// untouched for duplicates and for messages addressed elsewhere, so it
    /// is safe to call any number of times with the same message.
    pub fn apply_incoming(&mut self, room: &ConversationId, message: Message) -> bool {
        if !accepts(room, &message) {
            return false;
        }
        self.rooms.entry(room.clone()).or_default().apply(message)
    }

    /// Insert a message sent by this session ahead of its echo.
    pub fn insert_local(&mut self, room: &ConversationId, message: Message) -> bool {
        if !accepts(room, &message) {
            return false;
        }
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert_local(message)
    }

    pub fn clear(&mut self, room: &ConversationId) {
        self.rooms.remove(room);
    }

    pub fn log(&self, room: &ConversationId) -> Option<&RoomLog> {
        self.rooms.get(room)
    }

    pub fn messages(&self, room: &ConversationId) -> &[Message] {
        self.rooms
            .get(room)
            .map(|log| log.messages())
            .unwrap_or(&[])
    }

    pub fn is_loaded(&self, room: &ConversationId) -> bool {
        self.rooms.get(room).is_some_and(|log| log.is_loaded())
    }
}

fn accepts(room: &ConversationId, message: &Message) -> bool {
    if !message.belongs_to(room) {
        crate::log_debug!(
            "store: dropping message {} addressed to {} while merging {}",
            message.id,
            message.conversation(),
            room
        );
        return false;
    }
    if let Err(e) = message.validate() {
        crate::log_debug!("store: dropping message for {}: {}", room, e);
        return false;
    }
    true
}
