//! In-memory transport for driving the client without a network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use roomfeed_client::{ClientConfig, Connector, Link, ReconnectConfig, TransportError};
use roomfeed_shared::{ClientCommand, ConversationId, Message, ServerEvent, WsEnvelope};

pub const WAIT: Duration = Duration::from_secs(2);

/// Config with short reconnect delays so tests do not wait on backoff.
pub fn fast_config() -> ClientConfig {
    roomfeed_client::init_tracing("roomfeed_client=debug");
    ClientConfig::new("ws://relay.test/api/ws").with_reconnect(ReconnectConfig {
        initial_delay_ms: 10,
        max_delay_ms: 50,
        backoff_multiplier: 1.5,
    })
}

pub fn message(room: &ConversationId, id: &str, created_at: i64) -> Message {
    Message {
        id: id.to_string(),
        room_id: room.id.clone(),
        conversation_kind: room.kind,
        author_id: "someone".to_string(),
        text: format!("text {}", id),
        created_at,
    }
}

pub fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

/// Accepts or refuses connections and hands the server side of each link
/// to the paired [`MemoryServer`].
pub struct MemoryConnector {
    accepting: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    links: UnboundedSender<ServerEnd>,
}

pub struct MemoryServer {
    accepting: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    links: UnboundedReceiver<ServerEnd>,
}

pub fn memory_transport() -> (Arc<MemoryConnector>, MemoryServer) {
    let accepting = Arc::new(AtomicBool::new(true));
    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = unbounded();
    (
        Arc::new(MemoryConnector {
            accepting: accepting.clone(),
            attempts: attempts.clone(),
            links: tx,
        }),
        MemoryServer {
            accepting,
            attempts,
            links: rx,
        },
    )
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str, token: &str) -> Result<Link, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let (client_tx, server_rx) = unbounded::<String>();
        let (server_tx, client_rx) = unbounded::<Result<String, TransportError>>();
        self.links
            .unbounded_send(ServerEnd {
                token: token.to_string(),
                inbound: server_rx,
                outbound: server_tx,
            })
            .map_err(|_| TransportError::Closed)?;

        Ok(Link {
            sink: Box::pin(client_tx.sink_map_err(|_| TransportError::Closed)),
            stream: Box::pin(client_rx),
        })
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.links.next())
            .await
            .expect("no connection within timeout")
            .expect("connector dropped")
    }

    pub fn refuse(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn allow(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Server side of one link.
pub struct ServerEnd {
    pub token: String,
    inbound: UnboundedReceiver<String>,
    outbound: UnboundedSender<Result<String, TransportError>>,
}

impl ServerEnd {
    pub async fn next_command(&mut self) -> ClientCommand {
        let text = tokio::time::timeout(WAIT, self.inbound.next())
            .await
            .expect("no command within timeout")
            .expect("client closed the link");
        WsEnvelope::<ClientCommand>::from_json(&text)
            .expect("client sent a malformed frame")
            .payload
    }

    /// Asserts nothing arrives for `window`.
    pub async fn expect_quiet(&mut self, window: Duration) {
        if let Ok(Some(text)) = tokio::time::timeout(window, self.inbound.next()).await {
            panic!("unexpected command: {}", text);
        }
    }

    /// Asserts the client closes the link without sending anything more.
    pub async fn expect_closed(&mut self) {
        let next = tokio::time::timeout(WAIT, self.inbound.next())
            .await
            .expect("link still open after timeout");
        assert_eq!(next, None, "unexpected command before close");
    }

    pub fn push(&self, event: ServerEvent) {
        let json = WsEnvelope::new(event).to_json().expect("serialize event");
        self.push_raw(json);
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        self.outbound
            .unbounded_send(Ok(text.into()))
            .expect("client stream dropped");
    }

    pub fn recent(&self, room: &ConversationId, epoch: Option<u64>, messages: Vec<Message>) {
        self.push(ServerEvent::Recent {
            room_id: room.id.clone(),
            conversation_kind: room.kind,
            epoch,
            messages,
        });
    }

    /// Read the join and history request that follow a join, returning the
    /// request epoch.
    pub async fn expect_join(&mut self, room: &ConversationId) -> u64 {
        assert_eq!(self.next_command().await, ClientCommand::join(room));
        match self.next_command().await {
            ClientCommand::FetchRecent {
                room_id,
                conversation_kind,
                epoch,
            } => {
                assert_eq!(ConversationId::new(conversation_kind, room_id), *room);
                epoch
            }
            other => panic!("expected room:fetchRecent, got {:?}", other),
        }
    }

    /// Simulate a dropped link.
    pub fn drop_link(self) {}
}

/// Poll `check` until it holds or the wait runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within timeout"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
