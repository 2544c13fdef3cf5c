//! Sessions: one authenticated identity attached to one shared transport.
//!
//! A session owns the connection manager, the subscription tracker, the
//! message store and the send queue. Feeds attach to it and detach from it;
//! the transport lives while at least one feed is attached.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use roomfeed_shared::{ConversationId, Message, ServerEvent};
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::error::RoomFeedError;
use crate::feed::{FeedOptions, RoomFeed};
use crate::outbound::SendQueue;
use crate::store::MessageStore;
use crate::tracker::{LeaveOutcome, SubscriptionTracker};
use crate::ws::{ConnectionManager, ConnectionState, Connector, ListenerId, TungsteniteConnector};

/// Credentials issued by the external auth service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Opaque bearer token presented on connect.
    pub token: String,
    /// Author id stamped on outgoing messages.
    pub author_id: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>, author_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            author_id: author_id.into(),
        }
    }
}

/// The process-wide session used by [`RoomSession::shared`].
static SHARED_SESSION: Lazy<Mutex<Weak<RoomSession>>> = Lazy::new(|| Mutex::new(Weak::new()));

struct SessionCore {
    tracker: SubscriptionTracker,
    store: MessageStore,
    outbound: SendQueue,
    /// Bumped whenever a room's visible log changes.
    revisions: HashMap<ConversationId, watch::Sender<u64>>,
}

impl SessionCore {
    fn notify(&self, room: &ConversationId) {
        if let Some(tx) = self.revisions.get(room) {
            tx.send_modify(|rev| *rev += 1);
        }
    }

    fn revision_receiver(&mut self, room: &ConversationId) -> watch::Receiver<u64> {
        self.revisions
            .entry(room.clone())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    fn on_event(&mut self, room: &ConversationId, event: &ServerEvent) {
        if !self.tracker.is_joined(room) {
            crate::log_debug!("session: dropping event for {} after leave", room);
            return;
        }

        match event {
            ServerEvent::Message(message) => {
                if self.store.apply_incoming(room, message.clone()) {
                    self.notify(room);
                }
            }
            ServerEvent::Recent {
                epoch, messages, ..
            } => {
                if !self.tracker.resolve_history(room, *epoch) {
                    crate::log_debug!(
                        "session: discarding stale history for {} (epoch {:?}, current {:?})",
                        room,
                        epoch,
                        self.tracker.epoch(room)
                    );
                    return;
                }
                crate::log_debug!("session: history for {}: {} messages", room, messages.len());
                if self.store.merge_history(room, messages.clone()) {
                    self.notify(room);
                }
            }
            ServerEvent::Error { .. } => {}
        }
    }
}

/// What a feed holds while attached.
pub(crate) struct Attachment {
    pub listener: ListenerId,
    pub revisions: watch::Receiver<u64>,
}

/// One authenticated client and its shared transport.
pub struct RoomSession {
    credentials: Credentials,
    config: ClientConfig,
    manager: Arc<ConnectionManager>,
    core: Arc<Mutex<SessionCore>>,
}

impl RoomSession {
    /// Create a standalone session over `connector`. Nothing connects until
    /// the first feed attaches.
    pub fn new(
        config: ClientConfig,
        credentials: Credentials,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>, RoomFeedError> {
        config.validate()?;

        let manager = Arc::new(ConnectionManager::new(config.clone(), connector));
        let core = Arc::new(Mutex::new(SessionCore {
            tracker: SubscriptionTracker::new(),
            store: MessageStore::new(),
            outbound: SendQueue::new(credentials.author_id.clone()),
            revisions: HashMap::new(),
        }));

        let hook_core = Arc::downgrade(&core);
        let hook_manager = Arc::downgrade(&manager);
        manager.set_connected_hook(Arc::new(move || {
            let (Some(core), Some(manager)) = (hook_core.upgrade(), hook_manager.upgrade()) else {
                return;
            };
            let rejoined = core.lock().tracker.rejoin_all(&*manager);
            if !rejoined.is_empty() {
                crate::log_info!("session: re-joined {} rooms after connect", rejoined.len());
            }
        }));

        Ok(Arc::new(Self {
            credentials,
            config,
            manager,
            core,
        }))
    }

    /// The process-wide session for `credentials`, created on first use.
    ///
    /// A different token tears the previous session down (its feeds stop
    /// receiving) and starts a fresh one.
    pub fn shared(config: &ClientConfig, credentials: Credentials) -> Result<Arc<Self>, RoomFeedError> {
        let mut slot = SHARED_SESSION.lock();
        if let Some(existing) = slot.upgrade() {
            if existing.credentials.token == credentials.token {
                return Ok(existing);
            }
            crate::log_info!("session: token changed, tearing down the previous session");
            existing.shutdown();
        }

        let session = Self::new(config.clone(), credentials, Arc::new(TungsteniteConnector))?;
        *slot = Arc::downgrade(&session);
        Ok(session)
    }

    /// Open a feed for `room` on this session.
    pub fn open_feed(
        self: &Arc<Self>,
        room: impl Into<ConversationId>,
        options: FeedOptions,
    ) -> Result<RoomFeed, RoomFeedError> {
        RoomFeed::open(self, room, options)
    }

    pub fn author_id(&self) -> &str {
        &self.credentials.author_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Receiver for a "reconnecting" indicator.
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    /// Number of attached feeds.
    pub fn references(&self) -> usize {
        self.manager.references()
    }

    pub fn is_joined(&self, room: &ConversationId) -> bool {
        self.core.lock().tracker.is_joined(room)
    }

    pub fn is_loaded(&self, room: &ConversationId) -> bool {
        self.core.lock().store.is_loaded(room)
    }

    /// Copy of a room's ordered log.
    pub fn messages(&self, room: &ConversationId) -> Vec<Message> {
        self.core.lock().store.messages(room).to_vec()
    }

    /// Disconnect and forget every subscription and log.
    pub fn shutdown(&self) {
        self.manager.disconnect();
        let mut core = self.core.lock();
        core.tracker.clear();
        core.store = MessageStore::new();
        core.revisions.clear();
    }

    pub(crate) fn attach(&self, room: &ConversationId) -> Result<Attachment, RoomFeedError> {
        self.manager.acquire();
        if let Err(e) = self.manager.connect(&self.credentials.token) {
            self.manager.release();
            return Err(e);
        }

        // Listen before joining so a fast history reply is not dropped.
        let listener = self.manager.on_message(room, {
            let core = Arc::downgrade(&self.core);
            let room = room.clone();
            move |event| {
                if let Some(core) = core.upgrade() {
                    core.lock().on_event(&room, event);
                }
            }
        });

        let mut core = self.core.lock();
        core.tracker.join(room, &*self.manager);
        let revisions = core.revision_receiver(room);
        Ok(Attachment {
            listener,
            revisions,
        })
    }

    pub(crate) fn detach(&self, room: &ConversationId, listener: ListenerId) {
        self.manager.off_message(listener);
        {
            let mut core = self.core.lock();
            if core.tracker.leave(room, &*self.manager) == LeaveOutcome::Left {
                core.store.clear(room);
                core.revisions.remove(room);
            }
        }
        self.manager.release();
    }

    pub(crate) fn send(
        &self,
        room: &ConversationId,
        text: &str,
        optimistic: bool,
    ) -> Result<Message, RoomFeedError> {
        let mut core = self.core.lock();
        let message = core.outbound.send(room, text, &*self.manager)?;
        if optimistic && core.store.insert_local(room, message.clone()) {
            core.notify(room);
        }
        Ok(message)
    }
}
