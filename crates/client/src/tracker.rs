//! Room subscription tracking.
//!
//! The tracker is the only writer of subscription state and the only code
//! that emits `room:join`, `room:leave` and `room:fetchRecent`. Subscriptions
//! are reference counted so several feeds on one room share a single join and
//! a single history fetch.

use std::collections::HashMap;

use roomfeed_shared::{ClientCommand, ConversationId};

use crate::ws::CommandSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First reference: join and history fetch were issued (or will be on
    /// the next connect).
    Joined { epoch: u64 },
    /// The room was already joined; only the reference count moved.
    AlreadyJoined { epoch: u64, references: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Other references remain; nothing was emitted.
    Released { remaining: usize },
    /// Last reference gone; the subscription was dropped.
    Left,
    NotJoined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryState {
    Pending,
    Resolved,
}

#[derive(Debug, Clone)]
struct Subscription {
    references: usize,
    /// Tag of the current history request.
    epoch: u64,
    /// Connection generation the join was last sent on.
    announced_on: Option<u64>,
    history: HistoryState,
}

/// Which rooms this session is joined to.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    subscriptions: HashMap<ConversationId, Subscription>,
    /// Monotonic across all rooms, so a rejoined room never reuses an epoch.
    last_epoch: u64,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_epoch(&mut self) -> u64 {
        self.last_epoch += 1;
        self.last_epoch
    }

    pub fn join(&mut self, room: &ConversationId, sink: &dyn CommandSink) -> JoinOutcome {
        if let Some(sub) = self.subscriptions.get_mut(room) {
            sub.references += 1;
            return JoinOutcome::AlreadyJoined {
                epoch: sub.epoch,
                references: sub.references,
            };
        }

        let epoch = self.next_epoch();
        self.subscriptions.insert(
            room.clone(),
            Subscription {
                references: 1,
                epoch,
                announced_on: None,
                history: HistoryState::Pending,
            },
        );
        self.announce(room, sink);
        JoinOutcome::Joined { epoch }
    }

    pub fn leave(&mut self, room: &ConversationId, sink: &dyn CommandSink) -> LeaveOutcome {
        let Some(sub) = self.subscriptions.get_mut(room) else {
            return LeaveOutcome::NotJoined;
        };

        sub.references = sub.references.saturating_sub(1);
        if sub.references > 0 {
            return LeaveOutcome::Released {
                remaining: sub.references,
            };
        }

        let announced_on = sub.announced_on;
        self.subscriptions.remove(room);
        self.next_epoch();

        // A join that never reached the current connection needs no leave.
        if announced_on.is_some() && announced_on == sink.connection_generation() {
            crate::log_info!("tracker: leaving {}", room);
            if let Err(e) = sink.transmit(ClientCommand::leave(room)) {
                crate::log_warn!("tracker: leave for {} not sent: {}", room, e);
            }
        }
        LeaveOutcome::Left
    }

    /// Re-issue join and history fetch for every room not yet announced on
    /// the current connection. Called after each (re)connect.
    pub fn rejoin_all(&mut self, sink: &dyn CommandSink) -> Vec<ConversationId> {
        let Some(generation) = sink.connection_generation() else {
            return Vec::new();
        };

        let stale: Vec<ConversationId> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.announced_on != Some(generation))
            .map(|(room, _)| room.clone())
            .collect();

        for room in &stale {
            let epoch = self.next_epoch();
            if let Some(sub) = self.subscriptions.get_mut(room) {
                sub.epoch = epoch;
                sub.history = HistoryState::Pending;
            }
            self.announce(room, sink);
        }
        stale
    }

    fn announce(&mut self, room: &ConversationId, sink: &dyn CommandSink) {
        let Some(sub) = self.subscriptions.get_mut(room) else {
            return;
        };
        let Some(generation) = sink.connection_generation() else {
            crate::log_debug!("tracker: {} recorded, join deferred until connected", room);
            return;
        };
        if sub.announced_on == Some(generation) {
            return;
        }

        crate::log_info!("tracker: joining {} (epoch {})", room, sub.epoch);
        let sent = sink
            .transmit(ClientCommand::join(room))
            .and_then(|_| sink.transmit(ClientCommand::fetch_recent(room, sub.epoch)));
        match sent {
            Ok(()) => sub.announced_on = Some(generation),
            Err(e) => crate::log_warn!("tracker: join for {} not sent: {}", room, e),
        }
    }

    /// Accept a history result for `room`. Returns `true` exactly once per
    /// request; results for a left room, an older epoch or an already
    /// resolved request return `false`. A result without an epoch is matched
    /// to the outstanding request, if any.
    pub fn resolve_history(&mut self, room: &ConversationId, epoch: Option<u64>) -> bool {
        let Some(sub) = self.subscriptions.get_mut(room) else {
            return false;
        };
        if epoch.is_some_and(|e| e != sub.epoch) || sub.history == HistoryState::Resolved {
            return false;
        }
        sub.history = HistoryState::Resolved;
        true
    }

    pub fn is_joined(&self, room: &ConversationId) -> bool {
        self.subscriptions.contains_key(room)
    }

    pub fn references(&self, room: &ConversationId) -> usize {
        self.subscriptions
            .get(room)
            .map(|sub| sub.references)
            .unwrap_or(0)
    }

    pub fn epoch(&self, room: &ConversationId) -> Option<u64> {
        self.subscriptions.get(room).map(|sub| sub.epoch)
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.next_epoch();
    }
}
