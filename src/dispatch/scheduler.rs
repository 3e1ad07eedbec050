//! Delivery scheduler.
//!
//! Owns the retry policy and the task state machine transitions. Workers
//! claim due tasks through [`DeliveryScheduler::claim`], run the channel
//! adapter, and hand the classified outcome back to
//! [`DeliveryScheduler::record_outcome`], which updates the task store and
//! appends the ledger row. The scheduler never interprets channel failures
//! itself; it only applies the retry policy to the adapter's classification.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::database::repositories::{LedgerRepository, TaskRepository};
use crate::dispatch::channels::Outcome;
use crate::dispatch::task::{DeliveryRecord, DeliveryTask, TaskState};
use crate::Result;

/// Retry backoff policy: exponential with a cap, plus uniform jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            cap_ms: config.backoff_cap_ms,
            max_attempts: config.max_attempts,
        }
    }

    /// Deterministic part of the delay before attempt number `attempts + 1`:
    /// `base * 2^attempts`, saturating, capped.
    pub fn exponential_delay_ms(&self, attempts: u32) -> u64 {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.cap_ms)
    }

    /// Full delay including jitter in `[0, base_ms)`.
    ///
    /// Jitter is additive on top of the capped exponential term, so two
    /// tasks failing in the same instant do not retry in lockstep.
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        let jitter = if self.base_ms > 0 {
            rand::random::<u64>() % self.base_ms
        } else {
            0
        };
        self.exponential_delay_ms(attempts).saturating_add(jitter)
    }
}

/// Coordinates task claiming, outcome recording and cancellation.
pub struct DeliveryScheduler {
    tasks: Arc<dyn TaskRepository>,
    ledger: Arc<dyn LedgerRepository>,
    policy: BackoffPolicy,
    due_batch_size: i64,
}

impl DeliveryScheduler {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        ledger: Arc<dyn LedgerRepository>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            tasks,
            ledger,
            policy: BackoffPolicy::from_config(config),
            due_batch_size: config.due_batch_size,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Persist freshly derived tasks.
    pub async fn insert_tasks(&self, tasks: &[DeliveryTask]) -> Result<()> {
        self.tasks.insert_pending(tasks).await
    }

    /// Pending tasks due at `now_ms`.
    pub async fn due_tasks(&self, now_ms: i64) -> Result<Vec<DeliveryTask>> {
        self.tasks.due_tasks(now_ms, self.due_batch_size).await
    }

    /// Claim a task for delivery. Returns false when another worker won.
    pub async fn claim(&self, task: &DeliveryTask, now_ms: i64) -> Result<bool> {
        self.tasks.mark_in_flight(&task.task_id, now_ms).await
    }

    /// Record the outcome of one delivery attempt for a claimed task.
    ///
    /// Applies the state transition to the task store and appends exactly
    /// one ledger row. A retryable failure at the attempt ceiling is
    /// recorded as terminal. The attempt count covering this attempt is
    /// `task.attempt_count + 1`.
    pub async fn record_outcome(
        &self,
        task: &DeliveryTask,
        outcome: &Outcome,
        now_ms: i64,
    ) -> Result<()> {
        let attempt_count = task.attempt_count + 1;

        let (recorded, ledger_outcome, error, next_attempt_at) = match outcome {
            Outcome::Succeeded => {
                let applied = self
                    .tasks
                    .mark_succeeded(&task.task_id, attempt_count, now_ms)
                    .await?;
                (applied, TaskState::Succeeded, None, None)
            }
            Outcome::Terminal(reason) => {
                let applied = self
                    .tasks
                    .mark_terminal(&task.task_id, attempt_count, reason, now_ms)
                    .await?;
                (applied, TaskState::FailedTerminal, Some(reason.clone()), None)
            }
            Outcome::Retryable(reason) if attempt_count >= self.policy.max_attempts => {
                // Ceiling reached: the retryable failure becomes terminal.
                let error = format!("attempt ceiling reached: {}", reason);
                let applied = self
                    .tasks
                    .mark_terminal(&task.task_id, attempt_count, &error, now_ms)
                    .await?;
                (applied, TaskState::FailedTerminal, Some(error), None)
            }
            Outcome::Retryable(reason) => {
                let next = now_ms + self.policy.delay_ms(attempt_count) as i64;
                let applied = self
                    .tasks
                    .repark_retryable(&task.task_id, attempt_count, next, reason, now_ms)
                    .await?;
                (applied, TaskState::FailedRetryable, Some(reason.clone()), Some(next))
            }
        };

        if !recorded {
            // The task left in_flight under us (cancelled mid-attempt, or a
            // bug). Do not append a ledger row for a transition that never
            // happened.
            warn!(
                task_id = %task.task_id,
                outcome = ?outcome,
                "outcome write did not apply, skipping ledger append"
            );
            return Ok(());
        }

        debug!(
            task_id = %task.task_id,
            channel = %task.channel_type.as_str(),
            outcome = ledger_outcome.as_str(),
            attempt = attempt_count,
            "recorded delivery outcome"
        );

        self.ledger
            .append(&DeliveryRecord {
                id: 0,
                task_id: task.task_id.clone(),
                envelope_id: task.envelope_id.clone(),
                recipient_id: task.recipient_id.clone(),
                channel_type: task.channel_type,
                outcome: ledger_outcome,
                attempt_count,
                error,
                next_attempt_at,
                recorded_at: now_ms,
            })
            .await?;

        Ok(())
    }

    /// Cancel every still-pending task of an envelope. Cancelled tasks are
    /// ledgered as terminal so the audit trail stays complete. Returns the
    /// number of tasks cancelled.
    pub async fn cancel_envelope(&self, envelope_id: &str, now_ms: i64) -> Result<usize> {
        let pending = self.tasks.pending_task_ids(envelope_id).await?;
        let mut cancelled = 0;

        for task_id in pending {
            let Some(task) = self.tasks.cancel_pending(&task_id, now_ms).await? else {
                // Claimed or finished between the listing and the cancel.
                continue;
            };

            self.ledger
                .append(&DeliveryRecord {
                    id: 0,
                    task_id: task.task_id.clone(),
                    envelope_id: task.envelope_id.clone(),
                    recipient_id: task.recipient_id.clone(),
                    channel_type: task.channel_type,
                    outcome: TaskState::FailedTerminal,
                    attempt_count: task.attempt_count,
                    error: Some("cancelled".to_string()),
                    next_attempt_at: None,
                    recorded_at: now_ms,
                })
                .await?;
            cancelled += 1;
        }

        Ok(cancelled)
    }

    /// Tasks derived from one envelope, for status reporting.
    pub async fn tasks_for_envelope(&self, envelope_id: &str) -> Result<Vec<DeliveryTask>> {
        self.tasks.list_by_envelope(envelope_id).await
    }

    /// Ledger records for one envelope, in append order.
    pub async fn records_for_envelope(&self, envelope_id: &str) -> Result<Vec<DeliveryRecord>> {
        self.ledger.list_for_envelope(envelope_id).await
    }

    /// Re-park tasks a previous process left `in_flight`. Must run before
    /// any worker of this process claims.
    pub async fn recover_stranded(&self, now_ms: i64) -> Result<u64> {
        self.tasks.recover_in_flight(now_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{SqlxLedgerRepository, SqlxTaskRepository};
    use crate::database::testing::memory_pool;
    use crate::dispatch::channels::ChannelType;

    fn policy(base_ms: u64, cap_ms: u64, max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_ms,
            cap_ms,
            max_attempts,
        }
    }

    #[test]
    fn exponential_delay_doubles_until_cap() {
        let p = policy(5_000, 300_000, 8);
        assert_eq!(p.exponential_delay_ms(0), 5_000);
        assert_eq!(p.exponential_delay_ms(1), 10_000);
        assert_eq!(p.exponential_delay_ms(2), 20_000);
        assert_eq!(p.exponential_delay_ms(5), 160_000);
        assert_eq!(p.exponential_delay_ms(6), 300_000);
        assert_eq!(p.exponential_delay_ms(60), 300_000);
        // Shift overflow saturates instead of wrapping.
        assert_eq!(p.exponential_delay_ms(200), 300_000);
    }

    #[test]
    fn delay_is_monotonic_before_cap_and_bounded() {
        let p = policy(1_000, 64_000, 8);
        for attempts in 0..6 {
            let d = p.delay_ms(attempts);
            let floor = p.exponential_delay_ms(attempts);
            assert!(d >= floor, "delay below exponential floor");
            assert!(d < floor + p.base_ms, "jitter exceeds base");
        }
    }

    #[test]
    fn jitter_diverges_across_samples() {
        let p = policy(100_000, 1_000_000, 8);
        let samples: Vec<u64> = (0..32).map(|_| p.delay_ms(0)).collect();
        let all_equal = samples.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_equal, "jitter produced identical delays");
    }

    async fn seed_envelope(pool: &sqlx::SqlitePool, id: &str) {
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

    async fn scheduler_with_task(max_attempts: u32) -> (DeliveryScheduler, DeliveryTask) {
        let pool = memory_pool().await;
        seed_envelope(&pool, "env-1").await;
        let tasks = Arc::new(SqlxTaskRepository::new(pool.clone()));
        let ledger = Arc::new(SqlxLedgerRepository::new(pool));

        let config = DispatchConfig {
            max_attempts,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            ..Default::default()
        };
        let scheduler = DeliveryScheduler::new(tasks.clone(), ledger, &config);

        let task = DeliveryTask::new("env-1", "producer-1", ChannelType::OutboundWebhook, 1_000);
        tasks.insert_pending(std::slice::from_ref(&task)).await.unwrap();
        (scheduler, task)
    }

    #[tokio::test]
    async fn retryable_outcome_reparks_with_future_due_time() {
        let (scheduler, task) = scheduler_with_task(8).await;

        assert!(scheduler.claim(&task, 2_000).await.unwrap());
        scheduler
            .record_outcome(&task, &Outcome::Retryable("HTTP 503".to_string()), 2_000)
            .await
            .unwrap();

        let reloaded = &scheduler.tasks_for_envelope("env-1").await.unwrap()[0];
        assert_eq!(reloaded.state, TaskState::Pending);
        assert_eq!(reloaded.attempt_count, 1);
        assert!(reloaded.next_attempt_at > 2_000);

        // Not due until the backoff elapses.
        assert!(scheduler.due_tasks(2_000).await.unwrap().is_empty());
        assert_eq!(
            scheduler.due_tasks(reloaded.next_attempt_at).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn retryable_at_ceiling_becomes_terminal() {
        let (scheduler, mut task) = scheduler_with_task(3).await;

        for now in [2_000i64, 100_000, 200_000] {
            // Force due and claim regardless of jittered backoff.
            let stored = &scheduler.tasks_for_envelope("env-1").await.unwrap()[0];
            task.attempt_count = stored.attempt_count;
            assert!(scheduler.claim(&task, now).await.unwrap());
            scheduler
                .record_outcome(&task, &Outcome::Retryable("HTTP 503".to_string()), now)
                .await
                .unwrap();
        }

        let finished = &scheduler.tasks_for_envelope("env-1").await.unwrap()[0];
        assert_eq!(finished.state, TaskState::FailedTerminal);
        assert_eq!(finished.attempt_count, 3);
        assert!(
            finished
                .last_error
                .as_deref()
                .unwrap()
                .starts_with("attempt ceiling reached")
        );
    }

    #[tokio::test]
    async fn success_is_ledgered_once() {
        let (scheduler, task) = scheduler_with_task(8).await;

        assert!(scheduler.claim(&task, 2_000).await.unwrap());
        scheduler
            .record_outcome(&task, &Outcome::Succeeded, 2_000)
            .await
            .unwrap();

        let reloaded = &scheduler.tasks_for_envelope("env-1").await.unwrap()[0];
        assert_eq!(reloaded.state, TaskState::Succeeded);
        assert_eq!(reloaded.attempt_count, 1);
    }

    #[tokio::test]
    async fn unclaimed_task_outcome_is_dropped() {
        let (scheduler, task) = scheduler_with_task(8).await;

        // Never claimed: the write must not apply and no ledger row appears.
        scheduler
            .record_outcome(&task, &Outcome::Succeeded, 2_000)
            .await
            .unwrap();

        let reloaded = &scheduler.tasks_for_envelope("env-1").await.unwrap()[0];
        assert_eq!(reloaded.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn cancel_envelope_terminates_pending_and_ledgers() {
        let pool = memory_pool().await;
        seed_envelope(&pool, "env-1").await;
        let tasks = Arc::new(SqlxTaskRepository::new(pool.clone()));
        let ledger = Arc::new(SqlxLedgerRepository::new(pool));
        let scheduler =
            DeliveryScheduler::new(tasks.clone(), ledger.clone(), &DispatchConfig::default());

        let a = DeliveryTask::new("env-1", "producer-1", ChannelType::WebSocketPush, 1_000);
        let b = DeliveryTask::new("env-1", "producer-2", ChannelType::DurableRecord, 1_000);
        tasks.insert_pending(&[a.clone(), b.clone()]).await.unwrap();

        // One task already claimed; cancel must leave it alone.
        assert!(tasks.mark_in_flight(&a.task_id, 2_000).await.unwrap());

        assert_eq!(scheduler.cancel_envelope("env-1", 3_000).await.unwrap(), 1);

        let all = scheduler.tasks_for_envelope("env-1").await.unwrap();
        let b_after = all.iter().find(|t| t.task_id == b.task_id).unwrap();
        assert_eq!(b_after.state, TaskState::FailedTerminal);
        assert_eq!(b_after.last_error.as_deref(), Some("cancelled"));

        let a_after = all.iter().find(|t| t.task_id == a.task_id).unwrap();
        assert_eq!(a_after.state, TaskState::InFlight);

        let records = ledger.list_for_envelope("env-1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id, b.task_id);
    }
}
