//! General time utility functions

use chrono;

/// Number of nanoseconds in a second
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Convert a duration into a number of seconds, or `None` if overflow
pub fn duration_to_seconds(duration: chrono::Duration) -> Option<f64> {
    if let Some(ns) = duration.num_nanoseconds() {
        Some(ns as f64 / NANOS_PER_SECOND as f64)
    }
    else {
        None
    }
}

/// Get the number of seconds from `earlier` until `later`.
///
/// Negative if `later` is actually before `earlier`. Overflowing durations
/// saturate to infinity so that they are always treated as stale.
pub fn seconds_between(
    earlier: &chrono::DateTime<chrono::Utc>,
    later: &chrono::DateTime<chrono::Utc>
) -> f64 {
    duration_to_seconds(later.signed_duration_since(*earlier))
        .unwrap_or(std::f64::INFINITY)
}
