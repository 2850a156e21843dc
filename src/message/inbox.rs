use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::MessageStatus;
use crate::bus::Envelope;

/// Operator-driven transition on an inbox row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboxChange {
    /// Reset a failed key so the handler may run again.
    Requeue,
}

/// Marker row for a consumed message, keyed by its dedup key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: String,
    pub name: String,
    pub content: Vec<u8>,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub received_at: SystemTime,
    pub status: MessageStatus,
    pub retries: u32,
    pub expires_at: Option<SystemTime>,
    /// Optimistic concurrency token; 0 means "not stored yet".
    pub version: u64,
    pub last_error: Option<String>,
}

impl InboxMessage {
    /// First receipt of a delivery.
    pub fn received(key: impl Into<String>, envelope: &Envelope) -> Self {
        Self {
            id: key.into(),
            name: envelope.name.clone(),
            content: envelope.content.clone(),
            content_type: envelope.content_type().to_string(),
            headers: envelope.headers.clone(),
            received_at: SystemTime::now(),
            status: MessageStatus::Scheduled,
            retries: 0,
            expires_at: None,
            version: 0,
            last_error: None,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == MessageStatus::Succeeded
    }

    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.status == MessageStatus::Failed && self.retries >= max_retries
    }

    pub fn record_success(&mut self, expires_at: SystemTime) {
        self.status = MessageStatus::Succeeded;
        self.expires_at = Some(expires_at);
        self.last_error = None;
    }

    /// Count a failed attempt. A Succeeded row is final and stays untouched;
    /// returns `false` in that case.
    pub fn record_failure(&mut self, error: impl Into<String>) -> bool {
        if self.is_succeeded() {
            return false;
        }
        self.status = MessageStatus::Failed;
        self.retries += 1;
        self.last_error = Some(error.into());
        self.expires_at = None;
        true
    }

    /// Apply an operator change. Returns `false` when it is not legal.
    pub fn apply(&mut self, change: &InboxChange) -> bool {
        match change {
            InboxChange::Requeue => {
                if self.status != MessageStatus::Failed {
                    return false;
                }
                self.status = MessageStatus::Scheduled;
                self.retries = 0;
                self.last_error = None;
            }
        }
        true
    }

    /// Rebuild the delivered envelope, for local replay.
    pub fn to_envelope(&self) -> Envelope {
        let mut envelope = Envelope::new(self.id.clone(), self.name.clone(), self.content.clone());
        envelope.headers = self.headers.clone();
        envelope.headers.insert(Envelope::CONTENT_TYPE.to_string(), self.content_type.clone());
        envelope
    }
}
