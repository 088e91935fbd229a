//! Wall-clock time source.
//!
//! All protocol timestamps (`timestamp_ms`, `last_seen_ms`, RTT accounting)
//! use milliseconds since the Unix epoch. Monotonic scheduling of the
//! periodic loops is handled separately by `tokio::time`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as milliseconds since the Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
