pub mod bus;
mod codec;
mod collector;
mod config;
mod consumer;
mod dispatcher;
mod error;
mod event;
mod message;
mod monitor;
mod retry;
pub mod store;
mod transaction;
mod worker;

pub use bus::{
    Delivery, Envelope, InMemoryBroker, PublishError, Publisher, SubscribeError, Subscriber,
};
pub use codec::{Codec, CodecError};
pub use collector::{CollectReport, Collector, CollectorStats, CollectorThread};
pub use config::{
    ConfigError, ConsumerConfig, DedupStrategy, DispatcherConfig, OutboxConfig, RetentionConfig,
    RetryConfig,
};
pub use consumer::{
    content_hash, ConsumeOutcome, Consumer, ConsumerPipeline, ConsumerStats, ConsumerThread,
    Handler, HandlerRegistry,
};
pub use dispatcher::{
    CycleReport, DispatchAttempt, DispatchOutcome, Dispatcher, DispatcherStats, DispatcherThread,
};
pub use error::{ConsumeError, HandlerError, RegistryError, StoreError, TransactionError};
pub use event::IntegrationEvent;
pub use message::{
    InboxChange, InboxMessage, MessageId, MessageStatus, OutboxChange, OutboxMessage,
    StatusCounts,
};
pub use monitor::Monitor;
pub use retry::{ExhaustedHook, RetryPolicy};
pub use store::{
    MemoryStore, MemoryTransaction, MessageQuery, OutboxFilter, Store, StoreStatistics,
    Transaction,
};
pub use transaction::{PendingEvents, TransactionCoordinator};
pub use worker::{BackgroundWorker, StopSignal};

// Re-export the EventEmitter from the event_emitter_rs crate
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
