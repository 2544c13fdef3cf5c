//! WebSocket transport for the room feed.
//!
//! This module provides:
//! - A connection loop with auto-reconnect and backoff
//! - One shared [`ConnectionManager`] per session
//! - Room-scoped listeners fed from the inbound event stream
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              ConnectionManager               │
//! │  (reference counted, one per session token)  │
//! └──────────────────────────────────────────────┘
//!          │ spawns                 ▲ transmit
//!          ▼                        │
//!   ┌──────────────┐        ┌──────────────┐
//!   │ WsConnection │        │   WsHandle   │
//!   │ (tokio task) │◄───────│ (generation) │
//!   └──────────────┘        └──────────────┘
//!          │ on_event
//!          ▼
//!   ┌─────────────────────┐
//!   │  room listeners     │ ── pushes for unknown rooms are dropped
//!   └─────────────────────┘
//! ```
//!
//! The connection loop never gives up while the manager holds it; callers
//! observe [`ConnectionState`] instead of transport errors.

mod connection;
mod manager;

pub use connection::{
    CommandSink, ConnectionState, Connector, FrameSink, FrameStream, Link, TungsteniteConnector,
    WsConnection, WsHandle,
};
pub use manager::{ConnectionManager, ListenerId};
