//! Roomfeed client
//!
//! Keeps a live, deduplicated, ordered message feed per room over one shared
//! WebSocket connection per session. [`RoomFeed`] is the entry point; the
//! lower layers are public for hosts that want to drive them directly.

pub mod config;
pub mod error;
pub mod feed;
pub mod logging;
pub mod outbound;
pub mod session;
pub mod store;
pub mod tracker;
pub mod ws;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, ReconnectConfig};
pub use error::{RoomFeedError, TransportError};
pub use feed::{FeedOptions, FeedState, RoomFeed};
pub use logging::init_tracing;
pub use session::{Credentials, RoomSession};
pub use store::MessageStore;
pub use tracker::SubscriptionTracker;
pub use ws::{ConnectionManager, ConnectionState, Connector, Link, TungsteniteConnector};

pub use roomfeed_shared::{ConversationId, ConversationKind, Message};
