//! Epoch-millisecond timestamps.
//!
//! Envelope, task, ledger and inbox rows all store UTC times as INTEGER
//! epoch milliseconds, so due-time comparisons stay plain integer
//! predicates in SQL.

use chrono::{DateTime, Utc};

/// Current time as epoch milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Stored values were produced by [`datetime_to_ms`], so an out-of-range
/// millisecond count only happens on a corrupted row; fall back to now
/// rather than failing the read.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
