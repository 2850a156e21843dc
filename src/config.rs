//! Configuration for the dispatcher, consumer, retry policy and retention.
//!
//! Durations are plain millisecond counts so the config reads the same in
//! JSON, TOML or environment-derived maps. Every field has a default.
//!
//! ```
//! use sourced_outbox::OutboxConfig;
//!
//! let config = OutboxConfig::from_json(r#"{
//!     "dispatcher": { "batch_size": 50 },
//!     "retry": { "max_retries": 5 }
//! }"#).unwrap();
//!
//! assert_eq!(config.dispatcher.batch_size, 50);
//! assert_eq!(config.retry.max_retries, 5);
//! assert_eq!(config.consumer.conflict_retries, 3);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How the consumer derives the dedup key of a delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    /// Use the broker message id, which is the outbox row id for messages
    /// published by a dispatcher.
    #[default]
    MessageId,
    /// SHA-256 over the event name and content, for producers without stable ids.
    ContentHash,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub worker_id: String,
    /// Rows fetched per cycle.
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// How long a claimed row stays invisible to other dispatchers.
    pub lease_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("dispatcher-{}", std::process::id()),
            batch_size: 100,
            poll_interval_ms: 1_000,
            lease_ms: 60_000,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub poll_timeout_ms: u64,
    pub dedup: DedupStrategy,
    /// How often one delivery re-runs after losing a commit race.
    pub conflict_retries: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 500,
            dedup: DedupStrategy::MessageId,
            conflict_retries: 3,
        }
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a message is exhausted.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay that may be shaved off at random.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 50,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// How long a published outbox row is kept.
    pub succeeded_outbox_ms: u64,
    /// Dedup window for consumed messages.
    pub succeeded_inbox_ms: u64,
    pub collect_interval_ms: u64,
    /// Rows deleted per collector pass and table.
    pub collect_batch: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            succeeded_outbox_ms: 24 * 60 * 60 * 1_000,
            succeeded_inbox_ms: 24 * 60 * 60 * 1_000,
            collect_interval_ms: 5 * 60 * 1_000,
            collect_batch: 1_000,
        }
    }
}

impl RetentionConfig {
    pub fn succeeded_outbox(&self) -> Duration {
        Duration::from_millis(self.succeeded_outbox_ms)
    }

    pub fn succeeded_inbox(&self) -> Duration {
        Duration::from_millis(self.succeeded_inbox_ms)
    }

    pub fn collect_interval(&self) -> Duration {
        Duration::from_millis(self.collect_interval_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub dispatcher: DispatcherConfig,
    pub consumer: ConsumerConfig,
    pub retry: RetryConfig,
    pub retention: RetentionConfig,
}

impl OutboxConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: OutboxConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.dispatcher.worker_id.trim().is_empty() {
            return Err(invalid("dispatcher.worker_id", "must not be empty"));
        }
        if self.dispatcher.batch_size == 0 {
            return Err(invalid("dispatcher.batch_size", "must be at least 1"));
        }
        if self.dispatcher.lease_ms == 0 {
            return Err(invalid("dispatcher.lease_ms", "must be at least 1"));
        }
        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms",
                format!(
                    "{} exceeds retry.max_delay_ms {}",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry.jitter", "must be between 0 and 1"));
        }
        if self.retention.collect_batch == 0 {
            return Err(invalid("retention.collect_batch", "must be at least 1"));
        }
        Ok(())
    }
}
