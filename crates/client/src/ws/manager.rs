//! Connection manager: one shared transport per session.
//!
//! Higher layers never see raw transport failures. They observe
//! [`ConnectionState`] and register room-scoped listeners; pushes for a room
//! nobody listens to are dropped here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use roomfeed_shared::{ClientCommand, ConversationId, ServerEvent};
use tokio::sync::watch;

use super::connection::{
    CommandSink, ConnectionHooks, ConnectionState, Connector, LoopContext, WsConnection, WsHandle,
};
use crate::config::ClientConfig;
use crate::error::RoomFeedError;

/// Identifies a listener registered with [`ConnectionManager::on_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;
pub(crate) type ConnectedHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    by_room: Mutex<HashMap<ConversationId, Vec<(ListenerId, Handler)>>>,
}

impl ListenerRegistry {
    fn add(&self, room: &ConversationId, handler: Handler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.by_room
            .lock()
            .entry(room.clone())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut by_room = self.by_room.lock();
        let mut removed = false;
        by_room.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(lid, _)| *lid != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    fn clear(&self) {
        self.by_room.lock().clear();
    }

    fn dispatch(&self, event: &ServerEvent) {
        let Some(room) = event.conversation() else {
            if let ServerEvent::Error { code, message } = event {
                crate::log_warn!("Server reported error {}: {}", code, message);
            }
            return;
        };

        // Handlers run outside the registry lock so they may (un)register.
        let handlers: Vec<Handler> = self
            .by_room
            .lock()
            .get(&room)
            .map(|entries| entries.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            crate::log_debug!("Dropping event for unsubscribed {}", room);
            return;
        }
        for handler in handlers {
            handler(event);
        }
    }
}

#[derive(Default)]
struct ManagerInner {
    token: Option<String>,
    connection: Option<WsConnection>,
    /// Live references held by open feeds.
    references: usize,
}

/// Owns the transport for one session and fans inbound events out to
/// room-scoped listeners.
pub struct ConnectionManager {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<AtomicU64>,
    listeners: Arc<ListenerRegistry>,
    connected_hook: Arc<Mutex<Option<ConnectedHook>>>,
    inner: Mutex<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            connector,
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            listeners: Arc::new(ListenerRegistry::default()),
            connected_hook: Arc::new(Mutex::new(None)),
            inner: Mutex::new(ManagerInner::default()),
        }
    }

    /// Runs after every successful (re)connect.
    pub(crate) fn set_connected_hook(&self, hook: ConnectedHook) {
        *self.connected_hook.lock() = Some(hook);
    }

    /// Establish the transport for `token`.
    ///
    /// Idempotent: while a connection for the same token exists (connected or
    /// still connecting) this returns its handle. A different token tears the
    /// old connection down first.
    pub fn connect(&self, token: &str) -> Result<WsHandle, RoomFeedError> {
        let mut inner = self.inner.lock();

        if let Some(connection) = inner.connection.as_ref() {
            if inner.token.as_deref() == Some(token) {
                return Ok(connection.handle());
            }
            crate::log_info!("ConnectionManager: token changed, tearing down stale connection");
            inner.connection = None;
            self.listeners.clear();
            self.state.send_replace(ConnectionState::Disconnected);
        }

        let hooks = Arc::new(ConnectionHooks {
            on_connected: {
                let hook = self.connected_hook.clone();
                Box::new(move || {
                    let current = hook.lock().clone();
                    if let Some(current) = current {
                        current();
                    }
                })
            },
            on_event: {
                let listeners = self.listeners.clone();
                Box::new(move |envelope| listeners.dispatch(&envelope.payload))
            },
        });

        let connection = WsConnection::spawn(LoopContext {
            url: self.config.ws_url.clone(),
            token: token.to_string(),
            connector: self.connector.clone(),
            reconnect: self.config.reconnect.clone(),
            state: self.state.clone(),
            generation: self.generation.clone(),
            hooks,
        })?;

        crate::log_info!("ConnectionManager: created connection to {}", self.config.ws_url);
        let handle = connection.handle();
        inner.token = Some(token.to_string());
        inner.connection = Some(connection);
        Ok(handle)
    }

    /// Tear the transport down and drop every listener. Safe to call more
    /// than once.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        self.disconnect_locked(&mut inner);
    }

    fn disconnect_locked(&self, inner: &mut ManagerInner) {
        if inner.connection.take().is_some() {
            crate::log_info!("ConnectionManager: disconnected from {}", self.config.ws_url);
        }
        inner.token = None;
        self.listeners.clear();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Take a reference on the session's transport.
    pub fn acquire(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.references += 1;
        inner.references
    }

    /// Drop a reference; the last one disconnects.
    pub fn release(&self) -> usize {
        let mut inner = self.inner.lock();
        if inner.references == 0 {
            return 0;
        }
        inner.references -= 1;
        if inner.references == 0 {
            self.disconnect_locked(&mut inner);
        }
        inner.references
    }

    pub fn references(&self) -> usize {
        self.inner.lock().references
    }

    /// Register a listener for events addressed to `room`.
    pub fn on_message(
        &self,
        room: &ConversationId,
        handler: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.add(room, Arc::new(handler))
    }

    pub fn off_message(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn handle(&self) -> Option<WsHandle> {
        self.inner.lock().connection.as_ref().map(WsConnection::handle)
    }
}

impl CommandSink for ConnectionManager {
    fn connection_generation(&self) -> Option<u64> {
        if self.state.borrow().is_connected() {
            Some(self.generation.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    fn transmit(&self, cmd: ClientCommand) -> Result<(), RoomFeedError> {
        self.handle()
            .ok_or(RoomFeedError::TransportUnavailable)?
            .transmit(cmd)
    }
}
