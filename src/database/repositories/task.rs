//! Delivery task repository.
//!
//! The task store is the single serialization point in the dispatch core:
//! `mark_in_flight` is an atomic check-and-set (`UPDATE ... WHERE state =
//! 'pending'`), so two workers can never claim the same task. Every outcome
//! write is likewise guarded on the expected current state.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::database::retry::retry_on_sqlite_busy;
use crate::dispatch::channels::ChannelType;
use crate::dispatch::task::{DeliveryTask, TaskState};
use crate::{Error, Result};

/// Delivery task repository trait.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Persist a batch of freshly derived tasks in `pending` state.
    async fn insert_pending(&self, tasks: &[DeliveryTask]) -> Result<()>;

    /// All pending tasks due at `now_ms`, ordered by `next_attempt_at`
    /// ascending then `task_id` ascending.
    async fn due_tasks(&self, now_ms: i64, limit: i64) -> Result<Vec<DeliveryTask>>;

    /// Atomically transition `pending -> in_flight`. Returns false when the
    /// task was already claimed (or is no longer pending).
    async fn mark_in_flight(&self, task_id: &str, now_ms: i64) -> Result<bool>;

    /// Transition `in_flight -> succeeded`.
    async fn mark_succeeded(&self, task_id: &str, attempt_count: u32, now_ms: i64) -> Result<bool>;

    /// Transition `in_flight -> failed_terminal`.
    async fn mark_terminal(
        &self,
        task_id: &str,
        attempt_count: u32,
        error: &str,
        now_ms: i64,
    ) -> Result<bool>;

    /// Re-park a retryable failure as `pending` with a new due time.
    async fn repark_retryable(
        &self,
        task_id: &str,
        attempt_count: u32,
        next_attempt_at: i64,
        error: &str,
        now_ms: i64,
    ) -> Result<bool>;

    /// All tasks derived from one envelope, in creation order.
    async fn list_by_envelope(&self, envelope_id: &str) -> Result<Vec<DeliveryTask>>;

    /// Ids of still-pending tasks for one envelope.
    async fn pending_task_ids(&self, envelope_id: &str) -> Result<Vec<String>>;

    /// Cancel one pending task (`pending -> failed_terminal`). Returns the
    /// updated task, or None when it was no longer pending.
    async fn cancel_pending(&self, task_id: &str, now_ms: i64) -> Result<Option<DeliveryTask>>;

    /// Re-park every `in_flight` task as `pending`. Run at startup, before
    /// any worker claims: a row stuck `in_flight` means the previous
    /// process died between claim and outcome. Returns the count.
    async fn recover_in_flight(&self, now_ms: i64) -> Result<u64>;
}

/// SQLx implementation of TaskRepository.
pub struct SqlxTaskRepository {
    pool: SqlitePool,
}

impl SqlxTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get(&self, task_id: &str) -> Result<Option<DeliveryTask>> {
        let row = sqlx::query("SELECT * FROM delivery_task WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }
}

fn row_to_task(row: &SqliteRow) -> Result<DeliveryTask> {
    let channel_raw: String = row.get("channel_type");
    let channel_type = ChannelType::parse(&channel_raw).ok_or_else(|| {
        Error::Database(format!("unknown channel_type in storage: {}", channel_raw))
    })?;

    let state_raw: String = row.get("state");
    let state = TaskState::parse(&state_raw)
        .ok_or_else(|| Error::Database(format!("unknown task state in storage: {}", state_raw)))?;

    let attempt_count: i64 = row.get("attempt_count");

    Ok(DeliveryTask {
        task_id: row.get("task_id"),
        envelope_id: row.get("envelope_id"),
        recipient_id: row.get("recipient_id"),
        channel_type,
        state,
        attempt_count: attempt_count as u32,
        next_attempt_at: row.get("next_attempt_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl TaskRepository for SqlxTaskRepository {
    async fn insert_pending(&self, tasks: &[DeliveryTask]) -> Result<()> {
        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO delivery_task
                    (task_id, envelope_id, recipient_id, channel_type, state,
                     attempt_count, next_attempt_at, last_error, created_at, updated_at)
                VALUES (?, ?, ?, ?, 'pending', 0, ?, NULL, ?, ?)
                "#,
            )
            .bind(&task.task_id)
            .bind(&task.envelope_id)
            .bind(&task.recipient_id)
            .bind(task.channel_type.as_str())
            .bind(task.next_attempt_at)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn due_tasks(&self, now_ms: i64, limit: i64) -> Result<Vec<DeliveryTask>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM delivery_task
            WHERE state = 'pending' AND next_attempt_at <= ?
            ORDER BY next_attempt_at ASC, task_id ASC
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_task).collect()
    }

    async fn mark_in_flight(&self, task_id: &str, now_ms: i64) -> Result<bool> {
        retry_on_sqlite_busy("mark_in_flight", || async {
            let result = sqlx::query(
                "UPDATE delivery_task SET state = 'in_flight', updated_at = ? WHERE task_id = ? AND state = 'pending'",
            )
            .bind(now_ms)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn mark_succeeded(&self, task_id: &str, attempt_count: u32, now_ms: i64) -> Result<bool> {
        retry_on_sqlite_busy("mark_succeeded", || async {
            let result = sqlx::query(
                r#"
                UPDATE delivery_task
                SET state = 'succeeded', attempt_count = ?, last_error = NULL, updated_at = ?
                WHERE task_id = ? AND state = 'in_flight'
                "#,
            )
            .bind(attempt_count as i64)
            .bind(now_ms)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn mark_terminal(
        &self,
        task_id: &str,
        attempt_count: u32,
        error: &str,
        now_ms: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("mark_terminal", || async {
            let result = sqlx::query(
                r#"
                UPDATE delivery_task
                SET state = 'failed_terminal', attempt_count = ?, last_error = ?, updated_at = ?
                WHERE task_id = ? AND state = 'in_flight'
                "#,
            )
            .bind(attempt_count as i64)
            .bind(error)
            .bind(now_ms)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn repark_retryable(
        &self,
        task_id: &str,
        attempt_count: u32,
        next_attempt_at: i64,
        error: &str,
        now_ms: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("repark_retryable", || async {
            let result = sqlx::query(
                r#"
                UPDATE delivery_task
                SET state = 'pending', attempt_count = ?, next_attempt_at = ?, last_error = ?, updated_at = ?
                WHERE task_id = ? AND state = 'in_flight'
                "#,
            )
            .bind(attempt_count as i64)
            .bind(next_attempt_at)
            .bind(error)
            .bind(now_ms)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn list_by_envelope(&self, envelope_id: &str) -> Result<Vec<DeliveryTask>> {
        let rows = sqlx::query(
            "SELECT * FROM delivery_task WHERE envelope_id = ? ORDER BY created_at ASC, task_id ASC",
        )
        .bind(envelope_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_task).collect()
    }

    async fn pending_task_ids(&self, envelope_id: &str) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT task_id FROM delivery_task WHERE envelope_id = ? AND state = 'pending'",
        )
        .bind(envelope_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn cancel_pending(&self, task_id: &str, now_ms: i64) -> Result<Option<DeliveryTask>> {
        let updated = retry_on_sqlite_busy("cancel_pending", || async {
            let result = sqlx::query(
                r#"
                UPDATE delivery_task
                SET state = 'failed_terminal', last_error = 'cancelled', updated_at = ?
                WHERE task_id = ? AND state = 'pending'
                "#,
            )
            .bind(now_ms)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await?;

        if !updated {
            return Ok(None);
        }
        self.get(task_id).await
    }

    async fn recover_in_flight(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE delivery_task SET state = 'pending', updated_at = ? WHERE state = 'in_flight'",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::memory_pool;
    use std::sync::Arc;

    /// Tasks reference their envelope by foreign key, so fixtures must
    /// create the envelope row first.
    async fn seed_envelope(pool: &SqlitePool, id: &str) {
        sqlx::query(
            r#"
            INSERT INTO notification_envelope (id, event_type, subject_ref, recipients, payload, created_at)
            VALUES (?, 'event_created', 'plot-1', '["producer-1"]', ?, 0)
            "#,
        )
        .bind(id)
        .bind(b"{}".as_slice())
        .execute(pool)
        .await
        .unwrap();
    }

    async fn repo_with_task(next_attempt_at: i64) -> (Arc<SqlxTaskRepository>, DeliveryTask) {
        let pool = memory_pool().await;
        seed_envelope(&pool, "env-1").await;
        let repo = Arc::new(SqlxTaskRepository::new(pool));
        let mut task = DeliveryTask::new("env-1", "producer-1", ChannelType::DurableRecord, 1_000);
        task.next_attempt_at = next_attempt_at;
        repo.insert_pending(std::slice::from_ref(&task)).await.unwrap();
        (repo, task)
    }

    #[tokio::test]
    async fn due_tasks_order_is_deterministic() {
        let pool = memory_pool().await;
        seed_envelope(&pool, "env-1").await;
        let repo = SqlxTaskRepository::new(pool);

        let mut late = DeliveryTask::new("env-1", "r1", ChannelType::DurableRecord, 1_000);
        late.task_id = "b-task".to_string();
        late.next_attempt_at = 2_000;

        let mut early = DeliveryTask::new("env-1", "r2", ChannelType::DurableRecord, 1_000);
        early.task_id = "z-task".to_string();
        early.next_attempt_at = 1_000;

        let mut tied = DeliveryTask::new("env-1", "r3", ChannelType::DurableRecord, 1_000);
        tied.task_id = "a-task".to_string();
        tied.next_attempt_at = 2_000;

        repo.insert_pending(&[late, early, tied]).await.unwrap();

        let due = repo.due_tasks(5_000, 10).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|t| t.task_id.as_str()).collect();
        // next_attempt_at ascending, then task_id ascending for the tie
        assert_eq!(ids, vec!["z-task", "a-task", "b-task"]);
    }

    #[tokio::test]
    async fn tasks_not_yet_due_are_excluded() {
        let (repo, _task) = repo_with_task(10_000).await;
        assert!(repo.due_tasks(5_000, 10).await.unwrap().is_empty());
        assert_eq!(repo.due_tasks(10_000, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_in_flight_is_exclusive() {
        let (repo, task) = repo_with_task(1_000).await;

        assert!(repo.mark_in_flight(&task.task_id, 2_000).await.unwrap());
        // Second claim must fail: the task is no longer pending.
        assert!(!repo.mark_in_flight(&task.task_id, 2_000).await.unwrap());
    }

    #[tokio::test]
    async fn racing_claims_yield_exactly_one_winner() {
        let (repo, task) = repo_with_task(1_000).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = Arc::clone(&repo);
            let task_id = task.task_id.clone();
            handles.push(tokio::spawn(async move {
                repo.mark_in_flight(&task_id, 2_000).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn outcome_writes_require_in_flight_state() {
        let (repo, task) = repo_with_task(1_000).await;

        // Not claimed yet: outcome writes must not apply.
        assert!(!repo.mark_succeeded(&task.task_id, 1, 2_000).await.unwrap());
        assert!(
            !repo
                .repark_retryable(&task.task_id, 1, 9_000, "timeout", 2_000)
                .await
                .unwrap()
        );

        assert!(repo.mark_in_flight(&task.task_id, 2_000).await.unwrap());
        assert!(
            repo.repark_retryable(&task.task_id, 1, 9_000, "timeout", 2_000)
                .await
                .unwrap()
        );

        let reloaded = repo.get(&task.task_id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, TaskState::Pending);
        assert_eq!(reloaded.attempt_count, 1);
        assert_eq!(reloaded.next_attempt_at, 9_000);
        assert_eq!(reloaded.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn cancel_only_touches_pending_tasks() {
        let (repo, task) = repo_with_task(1_000).await;

        let cancelled = repo.cancel_pending(&task.task_id, 2_000).await.unwrap();
        let cancelled = cancelled.unwrap();
        assert_eq!(cancelled.state, TaskState::FailedTerminal);
        assert_eq!(cancelled.last_error.as_deref(), Some("cancelled"));

        // Already terminal: a second cancel is a no-op.
        assert!(repo.cancel_pending(&task.task_id, 3_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_task_key_rejected() {
        let (repo, task) = repo_with_task(1_000).await;

        let duplicate = DeliveryTask::new(
            task.envelope_id.clone(),
            task.recipient_id.clone(),
            task.channel_type,
            1_000,
        );
        let err = repo.insert_pending(&[duplicate]).await.unwrap_err();
        assert!(matches!(err, Error::DatabaseSqlx(_)));
    }

    #[tokio::test]
    async fn tasks_without_their_envelope_are_rejected() {
        let pool = memory_pool().await;
        let repo = SqlxTaskRepository::new(pool);

        let orphan = DeliveryTask::new("never-created", "producer-1", ChannelType::DurableRecord, 1_000);
        let err = repo.insert_pending(&[orphan]).await.unwrap_err();
        assert!(matches!(err, Error::DatabaseSqlx(_)));
    }

    #[tokio::test]
    async fn recover_reparks_in_flight_tasks() {
        let (repo, task) = repo_with_task(1_000).await;

        assert!(repo.mark_in_flight(&task.task_id, 2_000).await.unwrap());
        // Process dies here; the claim is never resolved.

        assert_eq!(repo.recover_in_flight(3_000).await.unwrap(), 1);

        let recovered = repo.get(&task.task_id).await.unwrap().unwrap();
        assert_eq!(recovered.state, TaskState::Pending);
        assert_eq!(recovered.updated_at, 3_000);
        // Due again and claimable.
        assert_eq!(repo.due_tasks(3_000, 10).await.unwrap().len(), 1);
        assert!(repo.mark_in_flight(&task.task_id, 3_000).await.unwrap());

        // Nothing else to recover.
        assert_eq!(repo.recover_in_flight(4_000).await.unwrap(), 1);
        assert_eq!(repo.recover_in_flight(5_000).await.unwrap(), 0);
    }
}
