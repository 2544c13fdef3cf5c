//! Test doubles shared by unit tests.

use std::cell::{Cell, RefCell};

use roomfeed_shared::ClientCommand;

use crate::error::RoomFeedError;
use crate::ws::CommandSink;

/// Records transmitted commands; the connection generation is set by hand.
pub(crate) struct RecordingSink {
    generation: Cell<Option<u64>>,
    commands: RefCell<Vec<ClientCommand>>,
}

impl RecordingSink {
    pub fn connected(generation: u64) -> Self {
        Self {
            generation: Cell::new(Some(generation)),
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            generation: Cell::new(None),
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn set_generation(&self, generation: Option<u64>) {
        self.generation.set(generation);
    }

    pub fn commands(&self) -> Vec<ClientCommand> {
        self.commands.borrow().clone()
    }

    pub fn take(&self) -> Vec<ClientCommand> {
        self.commands.take()
    }
}

impl CommandSink for RecordingSink {
    fn connection_generation(&self) -> Option<u64> {
        self.generation.get()
    }

    fn transmit(&self, cmd: ClientCommand) -> Result<(), RoomFeedError> {
        if self.generation.get().is_none() {
            return Err(RoomFeedError::TransportUnavailable);
        }
        self.commands.borrow_mut().push(cmd);
        Ok(())
    }
}
