use std::fmt;

use serde::{Deserialize, Serialize};

/// Status shared by outbox and inbox rows.
///
/// Inbox rows never use `Delayed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    #[default]
    Scheduled,
    Succeeded,
    Failed,
    Delayed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 4] = [
        MessageStatus::Scheduled,
        MessageStatus::Succeeded,
        MessageStatus::Failed,
        MessageStatus::Delayed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "Scheduled",
            MessageStatus::Succeeded => "Succeeded",
            MessageStatus::Failed => "Failed",
            MessageStatus::Delayed => "Delayed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-status row counts, as reported by a store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub scheduled: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: MessageStatus) {
        match status {
            MessageStatus::Scheduled => self.scheduled += 1,
            MessageStatus::Succeeded => self.succeeded += 1,
            MessageStatus::Failed => self.failed += 1,
            MessageStatus::Delayed => self.delayed += 1,
        }
    }

    pub fn get(&self, status: MessageStatus) -> usize {
        match status {
            MessageStatus::Scheduled => self.scheduled,
            MessageStatus::Succeeded => self.succeeded,
            MessageStatus::Failed => self.failed,
            MessageStatus::Delayed => self.delayed,
        }
    }

    pub fn total(&self) -> usize {
        self.scheduled + self.succeeded + self.failed + self.delayed
    }
}
