//! WebSocket handler for room messaging.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use roomfeed_shared::{
    parse_bearer, ClientCommand, ConversationId, ServerEvent, WsEnvelope, ERROR_BAD_REQUEST,
    ERROR_NOT_JOINED,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::state::{AppState, Publish};

type Outbox = mpsc::UnboundedSender<WsEnvelope<ServerEvent>>;

/// WebSocket upgrade handler. The session token arrives as
/// `Authorization: Bearer <token>`.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, (StatusCode, String)> {
    let author_id = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer)
        .and_then(|token| state.authenticate(token))
        .ok_or_else(|| {
            tracing::warn!("WebSocket auth failed: missing or unknown bearer token");
            (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
        })?;

    tracing::info!("WebSocket connection authenticated for author: {}", author_id);

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, author_id, state)))
}

/// Handle an authenticated WebSocket connection
async fn handle_socket(socket: WebSocket, author_id: String, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = Uuid::new_v4();
    tracing::debug!("Connection {} opened for {}", conn_id, author_id);

    let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<WsEnvelope<ServerEvent>>();
    let mut subscriptions: HashMap<ConversationId, JoinHandle<()>> = HashMap::new();

    // Task to forward events to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(event) = forward_rx.recv().await {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Main receive loop
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match WsEnvelope::<ClientCommand>::from_json(text.as_str()) {
                Ok(envelope) => {
                    handle_client_command(&envelope, &author_id, &mut subscriptions, &forward_tx, &state)
                        .await;
                }
                Err(e) => {
                    tracing::debug!("Rejecting malformed frame from {}: {}", author_id, e);
                    let _ = forward_tx.send(WsEnvelope::new(ServerEvent::Error {
                        code: ERROR_BAD_REQUEST.to_string(),
                        message: format!("malformed frame: {}", e),
                    }));
                }
            },
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    // Cleanup
    for (_, handle) in subscriptions {
        handle.abort();
    }
    send_task.abort();

    tracing::info!("WebSocket connection {} closed for author: {}", conn_id, author_id);
}

fn reject(forward_tx: &Outbox, envelope: &WsEnvelope<ClientCommand>, code: &str, message: String) {
    let _ = forward_tx.send(WsEnvelope::reply(
        ServerEvent::Error {
            code: code.to_string(),
            message,
        },
        envelope.id.clone(),
    ));
}

async fn handle_client_command(
    envelope: &WsEnvelope<ClientCommand>,
    author_id: &str,
    subscriptions: &mut HashMap<ConversationId, JoinHandle<()>>,
    forward_tx: &Outbox,
    state: &AppState,
) {
    let room = envelope.payload.conversation();
    if room.id.trim().is_empty() {
        reject(forward_tx, envelope, ERROR_BAD_REQUEST, "roomId is empty".to_string());
        return;
    }

    match &envelope.payload {
        ClientCommand::Join { .. } => {
            tracing::debug!("{} joining {}", author_id, room);

            if subscriptions.contains_key(&room) {
                return;
            }

            let mut broadcast_rx = state.subscribe(&room).await;
            let forward_tx_for_task = forward_tx.clone();
            let task_room = room.clone();

            let handle = tokio::spawn(async move {
                loop {
                    match broadcast_rx.recv().await {
                        Ok(event) => {
                            if forward_tx_for_task.send(event).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Subscriber to {} lagged, skipped {} events", task_room, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                tracing::debug!("Subscription task for {} ended", task_room);
            });

            subscriptions.insert(room, handle);
        }

        ClientCommand::Leave { .. } => {
            tracing::debug!("{} leaving {}", author_id, room);

            if let Some(handle) = subscriptions.remove(&room) {
                handle.abort();
            }
        }

        ClientCommand::Send { id, text, .. } => {
            if !subscriptions.contains_key(&room) {
                reject(forward_tx, envelope, ERROR_NOT_JOINED, format!("not joined to {}", room));
                return;
            }
            if id.trim().is_empty() || text.trim().is_empty() {
                reject(forward_tx, envelope, ERROR_BAD_REQUEST, "id and text are required".to_string());
                return;
            }

            tracing::debug!("{} sending {} to {}", author_id, id, room);
            match state.publish(&room, id, author_id, text).await {
                // Subscribers, the sender included, get it through the broadcast.
                Publish::Published(_) => {}
                Publish::Duplicate(existing) => {
                    let _ = forward_tx.send(WsEnvelope::reply(
                        ServerEvent::Message(existing),
                        envelope.id.clone(),
                    ));
                }
            }
        }

        ClientCommand::FetchRecent { epoch, .. } => {
            if !subscriptions.contains_key(&room) {
                reject(forward_tx, envelope, ERROR_NOT_JOINED, format!("not joined to {}", room));
                return;
            }

            let messages = state.recent(&room).await;
            tracing::debug!("Sending {} recent messages for {} (epoch {})", messages.len(), room, epoch);
            let _ = forward_tx.send(WsEnvelope::reply(
                ServerEvent::Recent {
                    room_id: room.id.clone(),
                    conversation_kind: room.kind,
                    epoch: Some(*epoch),
                    messages,
                },
                envelope.id.clone(),
            ));
        }
    }
}
