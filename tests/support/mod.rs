//! Shared fixtures for the integration tests.

#![allow(dead_code)]

pub mod orders;

use std::sync::Once;
use std::time::{Duration, Instant};

use sourced_outbox::RetryPolicy;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. `RUST_LOG` controls the
/// level; nothing is printed by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Poll `check` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Millisecond backoff without jitter, for deterministic tests.
pub fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(10), max_retries)
        .with_jitter(0.0)
}
