//! Error types for the room feed client.

use thiserror::Error;

/// Failures below the protocol layer. The connection loop absorbs these and
/// turns them into [`ConnectionState`](crate::ws::ConnectionState) changes.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("connection closed")]
    Closed,
}

/// Errors surfaced to callers of the public API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoomFeedError {
    /// The transport is not connected; the caller decides whether to retry.
    #[error("transport unavailable: not connected")]
    TransportUnavailable,

    #[error("feed for {0} is closed")]
    FeedClosed(String),

    #[error("message text is empty")]
    EmptyMessage,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Sessions spawn their connection loop on the ambient tokio runtime.
    #[error("no tokio runtime is running")]
    NoRuntime,
}
