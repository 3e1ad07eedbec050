//! Durable notification inbox repository.
//!
//! Storage target of the durable record channel. Rows are keyed by task id,
//! so a repeated delivery attempt is a no-op and the channel is idempotent
//! by construction. Read-state management (unread listing, mark-read,
//! cleanup of read rows) serves the recipient-facing notification list.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::dispatch::envelope::EventType;
use crate::{Error, Result};

/// One durable notification as seen by a recipient.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DurableNotification {
    pub task_id: String,
    pub envelope_id: String,
    pub recipient_id: String,
    pub event_type: EventType,
    pub subject_ref: String,
    pub payload: Vec<u8>,
    pub is_read: bool,
    pub created_at: i64,
}

/// Durable notification inbox repository trait.
#[async_trait]
pub trait InboxRepository: Send + Sync {
    /// Insert unless a row for this task id already exists.
    /// Returns true when a row was written.
    async fn insert_if_absent(&self, notification: &DurableNotification) -> Result<bool>;

    /// Unread notifications for a recipient, newest first.
    async fn unread_for_recipient(&self, recipient_id: &str) -> Result<Vec<DurableNotification>>;

    /// All notifications for a recipient, newest first.
    async fn list_for_recipient(
        &self,
        recipient_id: &str,
        limit: i64,
    ) -> Result<Vec<DurableNotification>>;

    /// Mark one notification read. Returns false when it does not exist.
    async fn mark_read(&self, task_id: &str) -> Result<bool>;

    /// Mark every notification for a recipient read; returns the count.
    async fn mark_all_read(&self, recipient_id: &str) -> Result<u64>;

    /// Delete read notifications for a recipient; returns the count.
    async fn delete_read(&self, recipient_id: &str) -> Result<u64>;
}

/// SQLx implementation of InboxRepository.
pub struct SqlxInboxRepository {
    pool: SqlitePool,
}

impl SqlxInboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_notification(row: &SqliteRow) -> Result<DurableNotification> {
    let event_type_raw: String = row.get("event_type");
    let event_type = EventType::parse(&event_type_raw).ok_or_else(|| {
        Error::Database(format!("unknown event_type in inbox: {}", event_type_raw))
    })?;

    let is_read: i64 = row.get("is_read");

    Ok(DurableNotification {
        task_id: row.get("task_id"),
        envelope_id: row.get("envelope_id"),
        recipient_id: row.get("recipient_id"),
        event_type,
        subject_ref: row.get("subject_ref"),
        payload: row.get("payload"),
        is_read: is_read != 0,
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl InboxRepository for SqlxInboxRepository {
    async fn insert_if_absent(&self, notification: &DurableNotification) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO durable_notification
                (task_id, envelope_id, recipient_id, event_type, subject_ref, payload, is_read, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&notification.task_id)
        .bind(&notification.envelope_id)
        .bind(&notification.recipient_id)
        .bind(notification.event_type.as_str())
        .bind(&notification.subject_ref)
        .bind(&notification.payload)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn unread_for_recipient(&self, recipient_id: &str) -> Result<Vec<DurableNotification>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_notification
            WHERE recipient_id = ? AND is_read = 0
            ORDER BY created_at DESC, task_id DESC
            "#,
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_notification).collect()
    }

    async fn list_for_recipient(
        &self,
        recipient_id: &str,
        limit: i64,
    ) -> Result<Vec<DurableNotification>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_notification
            WHERE recipient_id = ?
            ORDER BY created_at DESC, task_id DESC
            LIMIT ?
            "#,
        )
        .bind(recipient_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_notification).collect()
    }

    async fn mark_read(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE durable_notification SET is_read = 1 WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_all_read(&self, recipient_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE durable_notification SET is_read = 1 WHERE recipient_id = ? AND is_read = 0",
        )
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_read(&self, recipient_id: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM durable_notification WHERE recipient_id = ? AND is_read = 1")
                .bind(recipient_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
