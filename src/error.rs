use std::error::Error;

use thiserror::Error;

use crate::bus::SubscribeError;
use crate::codec::CodecError;

/// Error returned by application handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),
    #[error("concurrent write detected for {id} (expected version {expected}, got {actual})")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("{change} is not allowed for {id} in status {status}")]
    InvalidTransition {
        id: String,
        status: String,
        change: &'static str,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("could not (de)serialize row: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Failure of a business operation run through the transaction coordinator.
///
/// In every case the transaction was rolled back: neither the business writes
/// nor any outbox row are visible.
#[derive(Debug, Error)]
pub enum TransactionError<E> {
    #[error("business operation failed: {0}")]
    Business(E),
    #[error("could not encode integration event: {0}")]
    Encode(#[from] CodecError),
    #[error("storage commit failed: {0}")]
    StorageCommitFailed(#[source] StoreError),
}

impl<E> TransactionError<E> {
    pub fn business(&self) -> Option<&E> {
        match self {
            TransactionError::Business(err) => Some(err),
            _ => None,
        }
    }
}

/// Failure while consuming one delivery.
///
/// Duplicate deliveries are not errors; see `ConsumeOutcome::Duplicate`.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("handler for {name} failed: {source}")]
    HandlerFailed {
        name: String,
        #[source]
        source: HandlerError,
    },
    #[error("message {key} exhausted after {retries} attempts")]
    ConsumptionExhausted { key: String, retries: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] SubscribeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a handler is already registered for {0}")]
    DuplicateHandler(String),
    #[error("no handler registered for: {}", .0.join(", "))]
    MissingHandlers(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = StoreError::VersionConflict {
            id: "outbox:1".into(),
            expected: 2,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "concurrent write detected for outbox:1 (expected version 2, got 3)"
        );
        assert!(err.is_conflict());

        let missing = RegistryError::MissingHandlers(vec!["A".into(), "B".into()]);
        assert_eq!(missing.to_string(), "no handler registered for: A, B");
    }

    #[test]
    fn transaction_error_exposes_business_error() {
        let err: TransactionError<&str> = TransactionError::Business("out of stock");
        assert_eq!(err.business(), Some(&"out of stock"));

        let err: TransactionError<&str> =
            TransactionError::StorageCommitFailed(StoreError::Unavailable("down".into()));
        assert!(err.business().is_none());
        assert_eq!(err.to_string(), "storage commit failed: store unavailable: down");
    }
}
