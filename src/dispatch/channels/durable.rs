//! Durable record channel.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::database::repositories::{DurableNotification, InboxRepository};
use crate::database::time;
use crate::dispatch::channels::{ChannelAdapter, ChannelType, Outcome};
use crate::dispatch::envelope::NotificationEnvelope;
use crate::dispatch::task::DeliveryTask;

/// Writes the notification into the recipient's durable inbox.
///
/// The inbox row is keyed by task id, so a redelivered attempt after a
/// crash between write and acknowledgement is a no-op rather than a
/// duplicate. Storage errors are always classified retryable: the write is
/// local and transient errors (busy database, full disk recovering) are
/// the only realistic failures.
pub struct DurableRecordChannel {
    inbox: Arc<dyn InboxRepository>,
}

impl DurableRecordChannel {
    pub fn new(inbox: Arc<dyn InboxRepository>) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl ChannelAdapter for DurableRecordChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::DurableRecord
    }

    async fn attempt(&self, task: &DeliveryTask, envelope: &NotificationEnvelope) -> Outcome {
        let notification = DurableNotification {
            task_id: task.task_id.clone(),
            envelope_id: envelope.id.clone(),
            recipient_id: task.recipient_id.clone(),
            event_type: envelope.event_type,
            subject_ref: envelope.subject_ref.clone(),
            payload: envelope.payload.to_vec(),
            is_read: false,
            created_at: time::now_ms(),
        };

        match self.inbox.insert_if_absent(&notification).await {
            Ok(written) => {
                if !written {
                    debug!(task_id = %task.task_id, "durable record already present");
                }
                Outcome::Succeeded
            }
            Err(e) => Outcome::Retryable(format!("inbox write failed: {}", e)),
        }
    }
}
