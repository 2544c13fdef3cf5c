//! Room feed: the public surface for one room.
//!
//! A feed is tied to a UI mount. Opening it attaches to the session (which
//! connects on demand and joins the room); closing or dropping it leaves the
//! room and releases the session's transport reference.

use std::sync::Arc;

use roomfeed_shared::{ConversationId, Message};

use crate::config::ClientConfig;
use crate::error::RoomFeedError;
use crate::session::{Attachment, Credentials, RoomSession};
use crate::ws::ConnectionState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedOptions {
    /// Show sent messages before the server echoes them.
    pub optimistic_send: bool,
}

impl From<&ClientConfig> for FeedOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            optimistic_send: config.optimistic_send,
        }
    }
}

/// Lifecycle of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Created but not yet attached.
    Idle,
    /// Joined; waiting for the first history result.
    Joining,
    Live,
    Leaving,
    Closed,
}

enum Phase {
    Idle,
    Attached(Attachment),
    Leaving,
    Closed,
}

pub struct RoomFeed {
    session: Arc<RoomSession>,
    room: ConversationId,
    options: FeedOptions,
    phase: Phase,
}

impl RoomFeed {
    /// Open a feed on the process-wide session for `credentials`.
    pub fn connect(
        config: &ClientConfig,
        credentials: Credentials,
        room: impl Into<ConversationId>,
    ) -> Result<Self, RoomFeedError> {
        let session = RoomSession::shared(config, credentials)?;
        Self::open(&session, room, FeedOptions::from(config))
    }

    /// Create and start a feed on `session`.
    pub fn open(
        session: &Arc<RoomSession>,
        room: impl Into<ConversationId>,
        options: FeedOptions,
    ) -> Result<Self, RoomFeedError> {
        let mut feed = Self::new(session, room, options);
        feed.start()?;
        Ok(feed)
    }

    /// Create an idle feed; nothing is sent until [`RoomFeed::start`].
    pub fn new(
        session: &Arc<RoomSession>,
        room: impl Into<ConversationId>,
        options: FeedOptions,
    ) -> Self {
        Self {
            session: session.clone(),
            room: room.into(),
            options,
            phase: Phase::Idle,
        }
    }

    /// Attach to the session: connect if needed and join the room.
    /// Starting an attached feed does nothing; a closed feed cannot restart.
    pub fn start(&mut self) -> Result<(), RoomFeedError> {
        match self.phase {
            Phase::Idle => {}
            Phase::Attached(_) => return Ok(()),
            Phase::Leaving | Phase::Closed => {
                return Err(RoomFeedError::FeedClosed(self.room.to_string()));
            }
        }

        let attachment = self.session.attach(&self.room)?;
        crate::log_debug!("feed {}: Idle -> Joining", self.room);
        self.phase = Phase::Attached(attachment);
        Ok(())
    }

    pub fn room(&self) -> &ConversationId {
        &self.room
    }

    pub fn options(&self) -> FeedOptions {
        self.options
    }

    pub fn session(&self) -> &Arc<RoomSession> {
        &self.session
    }

    pub fn state(&self) -> FeedState {
        match self.phase {
            Phase::Idle => FeedState::Idle,
            Phase::Attached(_) if self.session.is_loaded(&self.room) => FeedState::Live,
            Phase::Attached(_) => FeedState::Joining,
            Phase::Leaving => FeedState::Leaving,
            Phase::Closed => FeedState::Closed,
        }
    }

    /// Ordered snapshot of the room's log. `None` until the feed is live.
    pub fn messages(&self) -> Option<Vec<Message>> {
        (self.state() == FeedState::Live).then(|| self.session.messages(&self.room))
    }

    /// Send `text` to the room. Returns the stamped message; delivery shows
    /// up later as the server echo.
    pub fn send(&self, text: &str) -> Result<Message, RoomFeedError> {
        if !matches!(self.phase, Phase::Attached(_)) {
            return Err(RoomFeedError::FeedClosed(self.room.to_string()));
        }
        self.session
            .send(&self.room, text, self.options.optimistic_send)
    }

    /// Wait until the room's log changes. Fails once the feed is closed or
    /// its session was torn down.
    pub async fn changed(&mut self) -> Result<(), RoomFeedError> {
        let room = &self.room;
        let Phase::Attached(attachment) = &mut self.phase else {
            return Err(RoomFeedError::FeedClosed(room.to_string()));
        };
        attachment
            .revisions
            .changed()
            .await
            .map_err(|_| RoomFeedError::FeedClosed(room.to_string()))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.connection_state()
    }

    /// Leave the room and release the transport. Idempotent; also runs on
    /// drop.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Leaving) {
            Phase::Attached(attachment) => {
                crate::log_debug!("feed {}: Leaving", self.room);
                self.session.detach(&self.room, attachment.listener);
            }
            Phase::Idle | Phase::Leaving | Phase::Closed => {}
        }
        self.phase = Phase::Closed;
    }
}

impl Drop for RoomFeed {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RoomFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomFeed")
            .field("room", &self.room)
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}
