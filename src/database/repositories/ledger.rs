//! Delivery ledger repository.
//!
//! Append-only: one row per recorded attempt outcome, never mutated.
//! Queried by the admin layer for audit and observability.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::dispatch::channels::ChannelType;
use crate::dispatch::task::{DeliveryRecord, TaskState};
use crate::{Error, Result};

/// Delivery ledger repository trait.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Append one record; returns the ledger row id.
    async fn append(&self, record: &DeliveryRecord) -> Result<i64>;

    /// Records for one task, in append order.
    async fn list_for_task(&self, task_id: &str) -> Result<Vec<DeliveryRecord>>;

    /// Records for one envelope, in append order.
    async fn list_for_envelope(&self, envelope_id: &str) -> Result<Vec<DeliveryRecord>>;
}

/// SQLx implementation of LedgerRepository.
pub struct SqlxLedgerRepository {
    pool: SqlitePool,
}

impl SqlxLedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &SqliteRow) -> Result<DeliveryRecord> {
    let channel_raw: String = row.get("channel_type");
    let channel_type = ChannelType::parse(&channel_raw).ok_or_else(|| {
        Error::Database(format!("unknown channel_type in ledger: {}", channel_raw))
    })?;

    let outcome_raw: String = row.get("outcome");
    let outcome = TaskState::parse(&outcome_raw)
        .ok_or_else(|| Error::Database(format!("unknown outcome in ledger: {}", outcome_raw)))?;

    let attempt_count: i64 = row.get("attempt_count");

    Ok(DeliveryRecord {
        id: row.get("id"),
        task_id: row.get("task_id"),
        envelope_id: row.get("envelope_id"),
        recipient_id: row.get("recipient_id"),
        channel_type,
        outcome,
        attempt_count: attempt_count as u32,
        error: row.get("error"),
        next_attempt_at: row.get("next_attempt_at"),
        recorded_at: row.get("recorded_at"),
    })
}

#[async_trait]
impl LedgerRepository for SqlxLedgerRepository {
    async fn append(&self, record: &DeliveryRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_record
                (task_id, envelope_id, recipient_id, channel_type, outcome,
                 attempt_count, error, next_attempt_at, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.task_id)
        .bind(&record.envelope_id)
        .bind(&record.recipient_id)
        .bind(record.channel_type.as_str())
        .bind(record.outcome.as_str())
        .bind(record.attempt_count as i64)
        .bind(&record.error)
        .bind(record.next_attempt_at)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn list_for_task(&self, task_id: &str) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query("SELECT * FROM delivery_record WHERE task_id = ? ORDER BY id ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn list_for_envelope(&self, envelope_id: &str) -> Result<Vec<DeliveryRecord>> {
        let rows =
            sqlx::query("SELECT * FROM delivery_record WHERE envelope_id = ? ORDER BY id ASC")
                .bind(envelope_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_record).collect()
    }
}
