use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use super::{MessageId, MessageStatus};
use crate::codec::Codec;

/// A status transition requested for an outbox row.
///
/// The store applies it with a compare-and-swap on `status_version`; the rules
/// for which transitions are legal live in [`OutboxMessage::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboxChange {
    /// Lease the row to a dispatcher until `until`.
    Claim {
        worker_id: String,
        now: SystemTime,
        until: SystemTime,
    },
    /// The broker acknowledged the publish.
    Succeed { expires_at: SystemTime },
    /// The publish failed; bumps `retries`.
    Fail { error: String },
    /// Operator reset of a failed row.
    Requeue,
}

impl OutboxChange {
    pub fn name(&self) -> &'static str {
        match self {
            OutboxChange::Claim { .. } => "Claim",
            OutboxChange::Succeed { .. } => "Succeed",
            OutboxChange::Fail { .. } => "Fail",
            OutboxChange::Requeue => "Requeue",
        }
    }
}

/// An integration event recorded in the outbox table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub name: String,
    pub content: Vec<u8>,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub created_at: SystemTime,
    pub status: MessageStatus,
    pub retries: u32,
    pub expires_at: Option<SystemTime>,
    pub status_version: u64,
    /// Earliest publish time for `Delayed` rows.
    pub available_at: Option<SystemTime>,
    pub locked_by: Option<String>,
    pub locked_until: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            id: MessageId::new(),
            name: name.into(),
            content,
            content_type: Codec::Json.content_type().to_string(),
            headers: BTreeMap::new(),
            created_at: SystemTime::now(),
            status: MessageStatus::Scheduled,
            retries: 0,
            expires_at: None,
            status_version: 0,
            available_at: None,
            locked_by: None,
            locked_until: None,
            last_error: None,
        }
    }

    /// Hold the message back until `delay` has elapsed.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.status = MessageStatus::Delayed;
        self.available_at = Some(self.created_at + delay);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == MessageStatus::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.status == MessageStatus::Failed
    }

    /// Failed and out of attempts: needs an operator.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.status == MessageStatus::Failed && self.retries >= max_retries
    }

    pub fn is_leased(&self, now: SystemTime) -> bool {
        self.locked_until.map(|until| until > now).unwrap_or(false)
    }

    pub fn is_due(&self, now: SystemTime) -> bool {
        self.available_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Whether a dispatcher may pick this row up at `now`.
    pub fn is_dispatchable(&self, max_retries: u32, now: SystemTime) -> bool {
        if self.is_leased(now) {
            return false;
        }
        match self.status {
            MessageStatus::Scheduled => true,
            MessageStatus::Failed => self.retries < max_retries,
            MessageStatus::Delayed => self.is_due(now),
            MessageStatus::Succeeded => false,
        }
    }

    /// Apply a transition in place and bump `status_version`.
    ///
    /// Returns `false` and leaves the row untouched when the transition is
    /// not legal from the current state.
    pub fn apply(&mut self, change: &OutboxChange) -> bool {
        match change {
            OutboxChange::Claim {
                worker_id,
                now,
                until,
            } => {
                if self.status == MessageStatus::Succeeded || self.is_leased(*now) {
                    return false;
                }
                self.locked_by = Some(worker_id.clone());
                self.locked_until = Some(*until);
            }
            OutboxChange::Succeed { expires_at } => {
                if self.status == MessageStatus::Succeeded {
                    return false;
                }
                self.status = MessageStatus::Succeeded;
                self.expires_at = Some(*expires_at);
                self.last_error = None;
                self.release();
            }
            OutboxChange::Fail { error } => {
                if self.status == MessageStatus::Succeeded {
                    return false;
                }
                self.status = MessageStatus::Failed;
                self.retries += 1;
                self.last_error = if error.is_empty() {
                    None
                } else {
                    Some(error.clone())
                };
                self.expires_at = None;
                self.release();
            }
            OutboxChange::Requeue => {
                if self.status != MessageStatus::Failed {
                    return false;
                }
                self.status = MessageStatus::Scheduled;
                self.retries = 0;
                self.last_error = None;
                self.available_at = None;
                self.release();
            }
        }
        self.status_version += 1;
        true
    }

    fn release(&mut self) {
        self.locked_by = None;
        self.locked_until = None;
    }
}
