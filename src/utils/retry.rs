//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Consumer loops build a
//! fresh iterator after every successful read so the delay resets.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Longest delay a consumer loop waits between failed reads.
pub const MAX_CONSUMER_DELAY: Duration = Duration::from_secs(30);

/// Backoff for consumer loop read/ack failures.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Unbounded attempts; the loop decides when to give up
/// - Jitter enabled
pub fn consumer_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(MAX_CONSUMER_DELAY)
        .without_max_times()
        .with_jitter()
}

/// Backoff for connecting to Redis at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
