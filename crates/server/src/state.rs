//! Relay state shared across connections.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use roomfeed_shared::{now_millis, ConversationId, Message, ServerEvent, WsEnvelope};
use tokio::sync::{broadcast, RwLock};

use crate::config::RelayConfig;

const CHANNEL_CAPACITY: usize = 100;

/// Result of [`AppState::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publish {
    /// Stored and broadcast to every subscriber.
    Published(Message),
    /// A message with this id was already stored; nothing was broadcast.
    Duplicate(Message),
}

struct Room {
    tx: broadcast::Sender<WsEnvelope<ServerEvent>>,
    history: VecDeque<Message>,
}

impl Room {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            history: VecDeque::new(),
        }
    }
}

struct Shared {
    started_at: DateTime<Utc>,
    tokens: HashMap<String, String>,
    history_limit: usize,
    rooms: RwLock<HashMap<ConversationId, Room>>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    shared: Arc<Shared>,
}

impl AppState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                started_at: Utc::now(),
                tokens: config.tokens.clone(),
                history_limit: config.history_limit,
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    /// Number of conversations that have been joined or written to.
    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Author id for a bearer token, if the token is known.
    pub fn authenticate(&self, token: &str) -> Option<String> {
        self.shared.tokens.get(token).cloned()
    }

    /// Subscribe to live pushes for `room`, creating it on first use.
    pub async fn subscribe(&self, room: &ConversationId) -> broadcast::Receiver<WsEnvelope<ServerEvent>> {
        {
            let rooms = self.shared.rooms.read().await;
            if let Some(existing) = rooms.get(room) {
                return existing.tx.subscribe();
            }
        }

        let mut rooms = self.shared.rooms.write().await;
        rooms
            .entry(room.clone())
            .or_insert_with(Room::new)
            .tx
            .subscribe()
    }

    /// Retained messages for `room`, oldest first.
    pub async fn recent(&self, room: &ConversationId) -> Vec<Message> {
        self.shared
            .rooms
            .read()
            .await
            .get(room)
            .map(|r| r.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Store and broadcast a message. The id comes from the sender and makes
    /// the call idempotent; the timestamp is assigned here and never goes
    /// backwards within a room.
    pub async fn publish(
        &self,
        room: &ConversationId,
        id: &str,
        author_id: &str,
        text: &str,
    ) -> Publish {
        let mut rooms = self.shared.rooms.write().await;
        let entry = rooms.entry(room.clone()).or_insert_with(Room::new);

        if let Some(existing) = entry.history.iter().find(|m| m.id == id) {
            return Publish::Duplicate(existing.clone());
        }

        let floor = entry.history.back().map(|m| m.created_at).unwrap_or(0);
        let message = Message {
            id: id.to_string(),
            room_id: room.id.clone(),
            conversation_kind: room.kind,
            author_id: author_id.to_string(),
            text: text.to_string(),
            created_at: now_millis().max(floor),
        };

        entry.history.push_back(message.clone());
        while entry.history.len() > self.shared.history_limit {
            entry.history.pop_front();
        }

        // No receivers is fine; the message is still retained.
        let _ = entry
            .tx
            .send(WsEnvelope::new(ServerEvent::Message(message.clone())));
        Publish::Published(message)
    }
}
