//! Dispatch service facade.
//!
//! The single entry point the rest of the platform talks to: event
//! submission, delivery status, cancellation and session lifecycle. Wires
//! the repositories, scheduler, adapters and worker pool together and owns
//! worker shutdown.

use bytes::Bytes;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DispatchConfig;
use crate::database::repositories::{
    DurableNotification, EnvelopeRepository, InboxRepository, SqlxEnvelopeRepository,
    SqlxInboxRepository, SqlxLedgerRepository, SqlxTaskRepository,
};
use crate::database::time;
use crate::dispatch::channels::{
    AdapterSet, DurableRecordChannel, OutboundWebhookChannel, WebSocketPushChannel,
};
use crate::dispatch::envelope::{EnvelopeBuilder, EventType, NotificationEnvelope};
use crate::dispatch::registry::SessionRegistry;
use crate::dispatch::routing::RoutingTable;
use crate::dispatch::scheduler::DeliveryScheduler;
use crate::dispatch::task::{DeliveryRecord, DeliveryTask};
use crate::dispatch::worker::DispatchWorkerPool;
use crate::Result;

/// Delivery status of one envelope: its tasks and the full attempt ledger.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeliveryStatus {
    pub envelope_id: String,
    pub tasks: Vec<DeliveryTask>,
    pub records: Vec<DeliveryRecord>,
}

/// The dispatch core service.
pub struct DispatchService {
    config: DispatchConfig,
    routing: RoutingTable,
    builder: EnvelopeBuilder,
    envelopes: Arc<dyn EnvelopeRepository>,
    inbox: Arc<dyn InboxRepository>,
    scheduler: Arc<DeliveryScheduler>,
    registry: Arc<SessionRegistry>,
    worker_pool: Arc<DispatchWorkerPool>,
    shutdown: CancellationToken,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchService {
    /// Wire the service against an initialized database.
    ///
    /// Tasks a previous process left `in_flight` (crash between claim and
    /// outcome) are re-parked as `pending` here, before any worker of this
    /// process can claim. Single logical deployment: no other process is
    /// holding claims.
    pub async fn new(
        pool: SqlitePool,
        config: DispatchConfig,
        routing: RoutingTable,
    ) -> Result<Self> {
        let envelopes: Arc<SqlxEnvelopeRepository> =
            Arc::new(SqlxEnvelopeRepository::new(pool.clone()));
        let tasks = Arc::new(SqlxTaskRepository::new(pool.clone()));
        let ledger = Arc::new(SqlxLedgerRepository::new(pool.clone()));
        let inbox: Arc<SqlxInboxRepository> = Arc::new(SqlxInboxRepository::new(pool));

        let registry = Arc::new(SessionRegistry::new());
        let scheduler = Arc::new(DeliveryScheduler::new(tasks, ledger, &config));

        let recovered = scheduler.recover_stranded(time::now_ms()).await?;
        if recovered > 0 {
            warn!(recovered, "re-parked deliveries stranded in flight by a previous run");
        }

        let adapters = AdapterSet::new(
            Arc::new(WebSocketPushChannel::new(registry.clone())),
            Arc::new(DurableRecordChannel::new(inbox.clone())),
            Arc::new(OutboundWebhookChannel::new(config.webhook.clone())?),
        );

        let worker_pool = Arc::new(DispatchWorkerPool::new(
            scheduler.clone(),
            adapters,
            envelopes.clone(),
            config.clone(),
        ));

        Ok(Self {
            builder: EnvelopeBuilder::new(config.max_payload_bytes),
            config,
            routing,
            envelopes,
            inbox,
            scheduler,
            registry,
            worker_pool,
            shutdown: CancellationToken::new(),
            workers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Start the dispatch worker pool.
    pub fn start(&self) {
        let handles = Arc::clone(&self.worker_pool).spawn(self.shutdown.clone());
        info!(workers = handles.len(), "dispatch service started");
        self.workers.lock().extend(handles);
    }

    /// Stop the workers; waits for in-flight attempts to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("dispatch service stopped");
    }

    /// Accept a domain occurrence: build and persist the envelope, derive
    /// one pending task per (recipient, routed channel) and return the
    /// envelope id.
    ///
    /// Persisting happens before any delivery attempt, so a crash after
    /// this returns loses nothing.
    pub async fn submit_event(
        &self,
        event_type: EventType,
        subject_ref: impl Into<String>,
        recipients: Vec<String>,
        payload: Bytes,
    ) -> Result<String> {
        let envelope = self
            .builder
            .build(event_type, subject_ref, recipients, payload)?;
        self.envelopes.insert(&envelope).await?;

        let now_ms = time::now_ms();
        let tasks = derive_tasks(&envelope, &self.routing, now_ms);
        self.scheduler.insert_tasks(&tasks).await?;

        info!(
            envelope_id = %envelope.id,
            event_type = %event_type.as_str(),
            tasks = tasks.len(),
            "event submitted"
        );
        Ok(envelope.id)
    }

    /// Delivery status of one envelope.
    pub async fn delivery_status(&self, envelope_id: &str) -> Result<DeliveryStatus> {
        if self.envelopes.get(envelope_id).await?.is_none() {
            return Err(crate::Error::not_found("envelope", envelope_id));
        }

        Ok(DeliveryStatus {
            envelope_id: envelope_id.to_string(),
            tasks: self.scheduler.tasks_for_envelope(envelope_id).await?,
            records: self.scheduler.records_for_envelope(envelope_id).await?,
        })
    }

    /// Cancel the still-pending deliveries of an envelope. Returns how many
    /// tasks were cancelled; in-flight and finished tasks are untouched.
    pub async fn cancel_envelope(&self, envelope_id: &str) -> Result<usize> {
        self.scheduler
            .cancel_envelope(envelope_id, time::now_ms())
            .await
    }

    /// Register a live websocket session for a recipient.
    pub fn on_connect(
        &self,
        recipient_id: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> tokio::sync::mpsc::Receiver<String> {
        let (tx, rx) = tokio::sync::mpsc::channel(self.config.session_send_buffer);
        self.registry.register(recipient_id, connection_id, tx);
        rx
    }

    /// Remove a live session.
    pub fn on_disconnect(&self, connection_id: &str) {
        self.registry.unregister(connection_id);
    }

    /// Fetch the stored envelope.
    pub async fn envelope(&self, envelope_id: &str) -> Result<Option<NotificationEnvelope>> {
        self.envelopes.get(envelope_id).await
    }

    /// Durable inbox of a recipient, unread only.
    pub async fn unread_notifications(
        &self,
        recipient_id: &str,
    ) -> Result<Vec<DurableNotification>> {
        self.inbox.unread_for_recipient(recipient_id).await
    }

    /// Mark one durable notification read.
    pub async fn mark_notification_read(&self, task_id: &str) -> Result<bool> {
        self.inbox.mark_read(task_id).await
    }

    /// Mark every durable notification of a recipient read.
    pub async fn mark_all_notifications_read(&self, recipient_id: &str) -> Result<u64> {
        self.inbox.mark_all_read(recipient_id).await
    }

    /// Delete the read notifications of a recipient. Returns the count.
    pub async fn delete_read_notifications(&self, recipient_id: &str) -> Result<u64> {
        self.inbox.delete_read(recipient_id).await
    }

    /// Run one synchronous dispatch pass. Test and tooling hook; production
    /// delivery runs through [`DispatchService::start`].
    pub async fn run_dispatch_once(&self, now_ms: i64) -> Result<usize> {
        self.worker_pool.run_once(now_ms).await
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

/// Derive pending delivery tasks for an envelope: the cross product of its
/// recipients and the channels its event type routes to.
fn derive_tasks(
    envelope: &NotificationEnvelope,
    routing: &RoutingTable,
    now_ms: i64,
) -> Vec<DeliveryTask> {
    let channels = routing.channels_for(envelope.event_type);
    let mut tasks = Vec::with_capacity(envelope.recipients.len() * channels.len());

    for recipient in &envelope.recipients {
        for channel in channels {
            tasks.push(DeliveryTask::new(&envelope.id, recipient, *channel, now_ms));
        }
    }
    tasks
}
