use std::collections::HashMap;
use std::time::SystemTime;

use crate::message::MessageId;

/// Backoff bookkeeping for a row whose last publish failed.
///
/// Lives only in the memory of one dispatcher; after a restart rows are
/// retried without waiting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchAttempt {
    pub id: MessageId,
    /// Failed attempts so far, as recorded on the row.
    pub attempt: u32,
    pub last_error: String,
    /// The row is skipped until this instant.
    pub not_before: SystemTime,
}

#[derive(Debug, Default)]
pub(crate) struct AttemptLog {
    attempts: HashMap<MessageId, DispatchAttempt>,
}

impl AttemptLog {
    pub(crate) fn is_deferred(&self, id: &MessageId, now: SystemTime) -> bool {
        self.attempts
            .get(id)
            .map(|attempt| attempt.not_before > now)
            .unwrap_or(false)
    }

    pub(crate) fn defer(&mut self, attempt: DispatchAttempt) {
        self.attempts.insert(attempt.id, attempt);
    }

    pub(crate) fn clear(&mut self, id: &MessageId) {
        self.attempts.remove(id);
    }

    /// Drop entries whose backoff elapsed; they no longer hold anything back.
    pub(crate) fn prune(&mut self, now: SystemTime) {
        self.attempts.retain(|_, attempt| attempt.not_before > now);
    }

    pub(crate) fn get(&self, id: &MessageId) -> Option<&DispatchAttempt> {
        self.attempts.get(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.attempts.len()
    }
}
