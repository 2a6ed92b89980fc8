//! Time utilities
//!
//! Heartbeat frames carry wall-clock milliseconds so that either side can
//! measure round trips from the echoed value.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds.
///
/// A clock set before the epoch yields 0 rather than panicking.
///
/// # Examples
/// ```
/// use tether_core::time::current_time_millis;
///
/// assert!(current_time_millis() > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Time elapsed since a millisecond timestamp; zero if it lies in the future.
pub fn elapsed_since(since_millis: u64) -> Duration {
    Duration::from_millis(current_time_millis().saturating_sub(since_millis))
}
