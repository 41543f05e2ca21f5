//! Exponential backoff strategies for retried steps.

use crate::constants::{MAX_BACKOFF_DELAY_MS, STARTING_BACKOFF_DELAY_MS};
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;

/// Backoff schedule granting `retries` additional attempts.
///
/// Delays grow 10ms, 20ms, 40ms... capped at 500ms. Feed the result to
/// `tokio_retry::Retry::spawn` or `RetryIf::spawn`.
pub fn retry_strategy(retries: usize) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(STARTING_BACKOFF_DELAY_MS / 2)
        .max_delay(Duration::from_millis(MAX_BACKOFF_DELAY_MS))
        .take(retries)
}
