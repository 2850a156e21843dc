//! Retry and backoff policy shared by the dispatcher and the consumer.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryConfig;

/// Alert callback for a message that used up its attempts.
///
/// Runs on the worker thread right after the row is marked exhausted, so it
/// should return quickly.
pub type ExhaustedHook<M> = Arc<dyn Fn(&M) + Send + Sync>;

/// Exponential backoff with jitter and a bounded number of attempts.
///
/// `next_delay(attempt) = min(base * 2^attempt, ceiling)`, then shortened by a
/// random fraction of up to `jitter` so concurrent retries spread out. The
/// result never exceeds the ceiling.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    ceiling: Duration,
    max_retries: u32,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, ceiling: Duration, max_retries: u32) -> Self {
        Self {
            base,
            ceiling,
            max_retries,
            jitter: 0.2,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: config.base_delay(),
            ceiling: config.max_delay(),
            max_retries: config.max_retries,
            jitter: config.jitter,
        }
    }

    /// Set the jitter fraction, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Delay before attempt number `attempt` (0-based) is retried.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let capped = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map(|delay| delay.min(self.ceiling))
            .unwrap_or(self.ceiling);

        if self.jitter <= 0.0 {
            return capped;
        }
        capped - capped.mul_f64(self.jitter * fastrand::f64())
    }

    /// Whether `retries` failures use up the attempt budget.
    pub fn is_exhausted(&self, retries: u32) -> bool {
        retries >= self.max_retries
    }
}
