//! Native WebSocket implementation using tokio-tungstenite.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver};
use futures_util::{future, SinkExt, StreamExt};
use roomfeed_shared::{bearer_header_value, ServerEvent, WsEnvelope};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use super::{ConnectionState, Connector, FrameSink, Link, Outgoing, WsHandle};
use crate::config::ReconnectConfig;
use crate::error::{RoomFeedError, TransportError};

/// Connects with `tokio-tungstenite`, sending the session token as
/// `Authorization: Bearer <token>` on the upgrade request.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str, token: &str) -> Result<Link, TransportError> {
        let mut request = url.into_client_request()?;
        let auth = HeaderValue::from_str(&bearer_header_value(token)).map_err(|e| {
            TransportError::InvalidEndpoint(format!("token is not a valid header value: {}", e))
        })?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws_stream, _response) = connect_async(request).await?;
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(TransportError::WebSocket)
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    crate::log_info!("WebSocket received close frame: {:?}", frame);
                    None
                }
                // Pong is handled automatically by tungstenite; binary is not part of the protocol
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::WebSocket(e))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Callbacks the connection loop runs inline, one at a time, on its own task.
pub(crate) struct ConnectionHooks {
    /// Runs after each successful (re)connect, before any frame is read.
    pub on_connected: Box<dyn Fn() + Send + Sync>,
    pub on_event: Box<dyn Fn(WsEnvelope<ServerEvent>) + Send + Sync>,
}

/// Everything the background loop needs.
pub(crate) struct LoopContext {
    pub url: String,
    pub token: String,
    pub connector: Arc<dyn Connector>,
    pub reconnect: ReconnectConfig,
    pub state: Arc<watch::Sender<ConnectionState>>,
    pub generation: Arc<AtomicU64>,
    pub hooks: Arc<ConnectionHooks>,
}

/// How long a closing connection may spend writing queued commands.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// A managed connection: a background task that connects, pumps frames and
/// reconnects with backoff until it is dropped.
///
/// Dropping it closes gracefully: commands already queued on a live link are
/// written before the link is closed. While not connected the loop stops at
/// once. A closing loop never writes connection state again.
pub struct WsConnection {
    closing: watch::Sender<bool>,
    handle: WsHandle,
}

impl WsConnection {
    /// Start the connection loop on the current tokio runtime.
    pub(crate) fn spawn(ctx: LoopContext) -> Result<Self, RoomFeedError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RoomFeedError::NoRuntime)?;
        let (sender, receiver) = unbounded();
        let (closing, closing_rx) = watch::channel(false);
        let handle = WsHandle::new(sender, ctx.state.subscribe(), ctx.generation.clone());
        runtime.spawn(run_connection_loop(ctx, receiver, closing_rx));
        Ok(Self { closing, handle })
    }

    /// Get a handle for sending commands
    pub fn handle(&self) -> WsHandle {
        self.handle.clone()
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.closing.send_replace(true);
    }
}

fn is_closing(closing: &watch::Receiver<bool>) -> bool {
    *closing.borrow()
}

async fn wait_closing(closing: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which also means closing.
    let _ = closing.wait_for(|closing| *closing).await;
}

/// Write `next` unless the owner has started closing. The check runs under
/// the state lock, so a manager that marks the connection closing and then
/// resets the state always has the last word.
fn publish_state(
    ctx: &LoopContext,
    closing: &watch::Receiver<bool>,
    next: ConnectionState,
) -> bool {
    let mut published = false;
    ctx.state.send_if_modified(|state| {
        if is_closing(closing) {
            return false;
        }
        published = true;
        if *state == next {
            return false;
        }
        *state = next;
        true
    });
    published
}

/// Sleep for `delay`. Returns `false` if the connection closed meanwhile.
async fn backoff(delay: Duration, closing: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = wait_closing(closing) => false,
    }
}

async fn run_connection_loop(
    ctx: LoopContext,
    mut outgoing: UnboundedReceiver<Outgoing>,
    mut closing: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;

    loop {
        let next = if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting { attempt }
        };
        if !publish_state(&ctx, &closing, next) {
            break;
        }

        let connected = tokio::select! {
            result = ctx.connector.connect(&ctx.url, &ctx.token) => result,
            _ = wait_closing(&mut closing) => break,
        };

        match connected {
            Ok(link) => {
                let generation = ctx.generation.fetch_add(1, Ordering::SeqCst) + 1;
                attempt = 0;
                if !publish_state(&ctx, &closing, ConnectionState::Connected) {
                    break;
                }
                crate::log_info!("WebSocket connected to {} (generation {})", ctx.url, generation);

                (ctx.hooks.on_connected)();

                match pump(&ctx, link, &mut outgoing, &mut closing, generation).await {
                    PumpExit::Closed => {
                        crate::log_info!("WebSocket to {} closed", ctx.url);
                    }
                    PumpExit::Abandoned => break,
                }

                attempt = 1;
                if !publish_state(&ctx, &closing, ConnectionState::Reconnecting { attempt }) {
                    break;
                }
                let delay = ctx.reconnect.delay(0);
                crate::log_info!("Reconnecting to {} in {}ms", ctx.url, delay.as_millis());
                if !backoff(delay, &mut closing).await {
                    break;
                }
            }
            Err(e) => {
                crate::log_error!("WebSocket error for {}: {}", ctx.url, e);

                let delay = ctx.reconnect.delay(attempt);
                crate::log_info!(
                    "Reconnecting to {} in {}ms (attempt {})",
                    ctx.url,
                    delay.as_millis(),
                    attempt + 1
                );
                if !backoff(delay, &mut closing).await {
                    break;
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }

    crate::log_info!("Stopped connection to {}", ctx.url);
}

enum PumpExit {
    /// The link failed or the peer went away.
    Closed,
    /// The owner closed the connection or every sender was dropped.
    Abandoned,
}

async fn pump(
    ctx: &LoopContext,
    link: Link,
    outgoing: &mut UnboundedReceiver<Outgoing>,
    closing: &mut watch::Receiver<bool>,
    generation: u64,
) -> PumpExit {
    let Link {
        mut sink,
        mut stream,
    } = link;

    loop {
        tokio::select! {
            biased;

            out = outgoing.next() => match out {
                Some(out) => {
                    if !write(ctx, &mut sink, out, generation).await {
                        return PumpExit::Closed;
                    }
                }
                None => break,
            },
            _ = wait_closing(closing) => break,
            frame = stream.next() => match frame {
                Some(Ok(text)) => handle_frame(ctx, &text),
                Some(Err(e)) => {
                    crate::log_error!("WebSocket read error: {}", e);
                    return PumpExit::Closed;
                }
                None => return PumpExit::Closed,
            },
        }
    }

    // Flush whatever was queued before the close, then say goodbye.
    let flushed = tokio::time::timeout(CLOSE_GRACE, async {
        while let Ok(Some(out)) = outgoing.try_next() {
            if !write(ctx, &mut sink, out, generation).await {
                return;
            }
        }
        let _ = sink.close().await;
    })
    .await;
    if flushed.is_err() {
        crate::log_warn!("Gave up flushing {} after {:?}", ctx.url, CLOSE_GRACE);
    }
    PumpExit::Abandoned
}

/// Write one queued command. Returns `false` when the link failed.
async fn write(ctx: &LoopContext, sink: &mut FrameSink, out: Outgoing, generation: u64) -> bool {
    if out.generation != generation {
        crate::log_debug!(
            "Dropping command issued for generation {} on generation {}",
            out.generation,
            generation
        );
        return true;
    }
    match out.envelope.to_json() {
        Ok(json) => {
            crate::log_debug!("Sending to {}: {}", ctx.url, json);
            if let Err(e) = sink.send(json).await {
                crate::log_error!("Send failed: {}", e);
                return false;
            }
        }
        Err(e) => crate::log_error!("Serialize failed: {}", e),
    }
    true
}

fn handle_frame(ctx: &LoopContext, text: &str) {
    match WsEnvelope::<ServerEvent>::from_json(text) {
        Ok(envelope) => (ctx.hooks.on_event)(envelope),
        Err(e) => crate::log_warn!("Dropping unparseable frame: {}", e),
    }
}
