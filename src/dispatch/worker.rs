//! Dispatch worker pool.
//!
//! Workers poll the scheduler for due tasks, claim them one at a time and
//! run the channel adapter for each claim. Claiming before attempting means
//! a pool of any size never double-delivers: losing the claim race is the
//! normal signal to skip a task.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::DispatchConfig;
use crate::database::repositories::EnvelopeRepository;
use crate::database::time;
use crate::dispatch::channels::{AdapterSet, Outcome};
use crate::dispatch::scheduler::DeliveryScheduler;
use crate::dispatch::task::DeliveryTask;
use crate::Result;

/// Pool of dispatch workers draining due delivery tasks.
pub struct DispatchWorkerPool {
    scheduler: Arc<DeliveryScheduler>,
    adapters: AdapterSet,
    envelopes: Arc<dyn EnvelopeRepository>,
    config: DispatchConfig,
}

impl DispatchWorkerPool {
    pub fn new(
        scheduler: Arc<DeliveryScheduler>,
        adapters: AdapterSet,
        envelopes: Arc<dyn EnvelopeRepository>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            scheduler,
            adapters,
            envelopes,
            config,
        }
    }

    /// One delivery attempt for a claimed task.
    ///
    /// A task whose envelope no longer exists fails terminally; a transient
    /// load error leaves the attempt retryable.
    async fn attempt(&self, task: &DeliveryTask) -> Outcome {
        let envelope = match self.envelopes.get(&task.envelope_id).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                return Outcome::Terminal(format!("envelope {} not found", task.envelope_id));
            }
            Err(e) => {
                return Outcome::Retryable(format!("envelope load failed: {}", e));
            }
        };

        self.adapters
            .adapter_for(task.channel_type)
            .attempt(task, &envelope)
            .await
    }

    /// Drain one batch of due tasks at `now_ms`. Returns the number of
    /// attempts made (claims won and recorded).
    ///
    /// Batches are processed sequentially per call; concurrency comes from
    /// running multiple pool workers, each calling this in its own loop.
    pub async fn run_once(&self, now_ms: i64) -> Result<usize> {
        let due = self.scheduler.due_tasks(now_ms).await?;
        let mut attempted = 0;

        for task in due {
            if !self.scheduler.claim(&task, now_ms).await? {
                // Another worker got there first.
                continue;
            }

            let outcome = self.attempt(&task).await;
            self.scheduler.record_outcome(&task, &outcome, now_ms).await?;
            attempted += 1;
        }

        Ok(attempted)
    }

    /// Spawn the configured number of worker loops. Each loop polls until
    /// the token is cancelled; in-flight attempts finish before exit.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.worker_count);

        for worker_id in 0..self.config.worker_count {
            let pool = Arc::clone(&self);
            let token = token.clone();

            handles.push(tokio::spawn(async move {
                info!(worker_id, "dispatch worker started");
                let mut interval = tokio::time::interval(pool.config.poll_interval());
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {}
                    }

                    match pool.run_once(time::now_ms()).await {
                        Ok(0) => {}
                        Ok(n) => debug!(worker_id, attempts = n, "dispatch pass finished"),
                        Err(e) => error!(worker_id, error = %e, "dispatch pass failed"),
                    }
                }
                info!(worker_id, "dispatch worker stopped");
            }));
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;

    use crate::database::repositories::{
        SqlxEnvelopeRepository, SqlxInboxRepository, SqlxLedgerRepository, SqlxTaskRepository,
        TaskRepository,
    };
    use crate::database::testing::memory_pool;
    use crate::dispatch::channels::{
        ChannelType, DurableRecordChannel, OutboundWebhookChannel, WebSocketPushChannel,
    };
    use crate::dispatch::envelope::{EnvelopeBuilder, EventType};
    use crate::dispatch::registry::SessionRegistry;
    use crate::dispatch::task::TaskState;

    struct Fixture {
        pool: Arc<DispatchWorkerPool>,
        tasks: Arc<SqlxTaskRepository>,
        envelopes: Arc<SqlxEnvelopeRepository>,
        registry: Arc<SessionRegistry>,
        db: sqlx::SqlitePool,
    }

    async fn fixture() -> Fixture {
        let db = memory_pool().await;
        let tasks = Arc::new(SqlxTaskRepository::new(db.clone()));
        let ledger = Arc::new(SqlxLedgerRepository::new(db.clone()));
        let envelopes = Arc::new(SqlxEnvelopeRepository::new(db.clone()));
        let inbox = Arc::new(SqlxInboxRepository::new(db.clone()));
        let registry = Arc::new(SessionRegistry::new());

        let config = DispatchConfig::default();
        let scheduler = Arc::new(DeliveryScheduler::new(tasks.clone(), ledger, &config));
        let adapters = AdapterSet::new(
            Arc::new(WebSocketPushChannel::new(registry.clone())),
            Arc::new(DurableRecordChannel::new(inbox)),
            Arc::new(OutboundWebhookChannel::new(config.webhook.clone()).unwrap()),
        );

        Fixture {
            pool: Arc::new(DispatchWorkerPool::new(
                scheduler,
                adapters,
                envelopes.clone(),
                config,
            )),
            tasks,
            envelopes,
            registry,
            db,
        }
    }

    async fn seed_envelope(f: &Fixture, recipient: &str) -> String {
        let envelope = EnvelopeBuilder::new(1024)
            .build(
                EventType::EventCreated,
                "plot-1",
                vec![recipient.to_string()],
                Bytes::from_static(br#"{"kind":"sowing"}"#),
            )
            .unwrap();
        f.envelopes.insert(&envelope).await.unwrap();
        envelope.id
    }

    #[tokio::test]
    async fn run_once_delivers_due_tasks() {
        let f = fixture().await;
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        f.registry.register("producer-1", "conn-1", tx);

        let envelope_id = seed_envelope(&f, "producer-1").await;
        let task = DeliveryTask::new(&envelope_id, "producer-1", ChannelType::WebSocketPush, 1_000);
        f.tasks.insert_pending(std::slice::from_ref(&task)).await.unwrap();

        assert_eq!(f.pool.run_once(1_000).await.unwrap(), 1);
        assert!(rx.try_recv().is_ok());

        let stored = f.tasks.list_by_envelope(&envelope_id).await.unwrap();
        assert_eq!(stored[0].state, TaskState::Succeeded);
        assert_eq!(stored[0].attempt_count, 1);

        // Nothing left due.
        assert_eq!(f.pool.run_once(2_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_envelope_fails_terminally() {
        let f = fixture().await;

        // The foreign key makes a dangling task impossible through normal
        // operation; stage one the way external database surgery would.
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&f.db)
            .await
            .unwrap();
        let task = DeliveryTask::new("no-such-envelope", "producer-1", ChannelType::DurableRecord, 1_000);
        f.tasks.insert_pending(std::slice::from_ref(&task)).await.unwrap();
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&f.db)
            .await
            .unwrap();

        assert_eq!(f.pool.run_once(1_000).await.unwrap(), 1);

        let stored = f.tasks.list_by_envelope("no-such-envelope").await.unwrap();
        assert_eq!(stored[0].state, TaskState::FailedTerminal);
        assert!(stored[0].last_error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn tasks_not_due_are_left_alone() {
        let f = fixture().await;
        let envelope_id = seed_envelope(&f, "producer-1").await;
        let mut task =
            DeliveryTask::new(&envelope_id, "producer-1", ChannelType::DurableRecord, 1_000);
        task.next_attempt_at = 50_000;
        f.tasks.insert_pending(std::slice::from_ref(&task)).await.unwrap();

        assert_eq!(f.pool.run_once(1_000).await.unwrap(), 0);
        assert_eq!(f.pool.run_once(50_000).await.unwrap(), 1);
    }
}
