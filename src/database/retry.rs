//! SQLITE_BUSY retry for task state writes.
//!
//! Claim and outcome updates are single-row UPDATEs that race the dispatch
//! workers against submission inserts. Under WAL only one writer proceeds
//! at a time; a loser sees SQLITE_BUSY. The writes are cheap, so the retry
//! window is short: a handful of attempts with millisecond delays, jittered
//! so racing workers do not re-collide.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const MAX_RETRIES: u32 = 6;
const BASE_DELAY_MS: u64 = 5;
const MAX_DELAY_MS: u64 = 320;

fn is_sqlite_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx::Error::Database(db_err)) = err else {
        return false;
    };

    // 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED; extended codes (261, 517) keep
    // the primary code in the low byte.
    match db_err.code().as_deref().and_then(|c| c.parse::<u32>().ok()) {
        Some(code) => matches!(code & 0xff, 5 | 6),
        None => db_err.message().to_ascii_lowercase().contains("locked"),
    }
}

/// Run `op`, retrying on SQLITE_BUSY with jittered exponential delays.
/// Any other error, and busy beyond the retry window, propagate as-is.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 0..MAX_RETRIES {
        match op().await {
            Err(err) if is_sqlite_busy(&err) => {
                let backoff = (BASE_DELAY_MS << attempt).min(MAX_DELAY_MS);
                let delay = backoff + rand::random::<u64>() % backoff;
                debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay,
                    "database busy, retrying"
                );
                sleep(Duration::from_millis(delay)).await;
            }
            result => return result,
        }
    }
    op().await
}
