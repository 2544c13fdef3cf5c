//! WebSocket connection with state management and auto-reconnect.
//!
//! This module provides the shared types; the tokio-tungstenite loop lives
//! in `connection_native`.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_channel::mpsc::UnboundedSender;
use futures_util::{Sink, Stream};
use roomfeed_shared::{ClientCommand, WsEnvelope};
use tokio::sync::watch;

use crate::error::{RoomFeedError, TransportError};

mod connection_native;

pub use connection_native::{TungsteniteConnector, WsConnection};
pub(crate) use connection_native::{ConnectionHooks, LoopContext};

/// Connection state for a session's transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Outgoing text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
/// Incoming text frames; the stream ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An established duplex link carrying JSON text frames.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens links to the room server. The token is presented as a bearer
/// credential; a rejected credential is reported as a plain connect error.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str, token: &str) -> Result<Link, TransportError>;
}

/// Where the tracker and send queue put protocol commands.
pub trait CommandSink {
    /// Generation of the live connection, `None` while not connected. Each
    /// successful (re)connect gets a new generation.
    fn connection_generation(&self) -> Option<u64>;

    /// Queue a command on the live connection without waiting for it to be
    /// written. Fails fast when not connected.
    fn transmit(&self, cmd: ClientCommand) -> Result<(), RoomFeedError>;
}

/// A command tagged with the connection generation it was issued for.
/// The writer discards commands issued for an earlier connection.
pub(crate) struct Outgoing {
    pub generation: u64,
    pub envelope: WsEnvelope<ClientCommand>,
}

/// Handle for sending commands through a WebSocket connection
#[derive(Clone)]
pub struct WsHandle {
    sender: UnboundedSender<Outgoing>,
    state: watch::Receiver<ConnectionState>,
    generation: Arc<AtomicU64>,
}

impl WsHandle {
    pub(crate) fn new(
        sender: UnboundedSender<Outgoing>,
        state: watch::Receiver<ConnectionState>,
        generation: Arc<AtomicU64>,
    ) -> Self {
        Self {
            sender,
            state,
            generation,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }
}

impl CommandSink for WsHandle {
    fn connection_generation(&self) -> Option<u64> {
        if self.state.borrow().is_connected() {
            Some(self.generation.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    fn transmit(&self, cmd: ClientCommand) -> Result<(), RoomFeedError> {
        let generation = self
            .connection_generation()
            .ok_or(RoomFeedError::TransportUnavailable)?;
        crate::log_debug!("WsHandle::transmit (generation {}): {:?}", generation, cmd);
        self.sender
            .unbounded_send(Outgoing {
                generation,
                envelope: WsEnvelope::new(cmd),
            })
            .map_err(|_| RoomFeedError::TransportUnavailable)
    }
}
