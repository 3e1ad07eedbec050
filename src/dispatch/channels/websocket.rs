//! Live websocket push channel.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::dispatch::channels::{ChannelAdapter, ChannelType, Outcome};
use crate::dispatch::envelope::NotificationEnvelope;
use crate::dispatch::registry::SessionRegistry;
use crate::dispatch::task::DeliveryTask;

/// Pushes notification frames to a recipient's live websocket sessions.
///
/// Delivery succeeds when at least one session accepts the frame. A
/// recipient with no live session at attempt time fails terminally: live
/// push is only meaningful for connected recipients, durable delivery is
/// the durable record channel's job.
pub struct WebSocketPushChannel {
    registry: Arc<SessionRegistry>,
}

impl WebSocketPushChannel {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ChannelAdapter for WebSocketPushChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WebSocketPush
    }

    async fn attempt(&self, task: &DeliveryTask, envelope: &NotificationEnvelope) -> Outcome {
        let handles = self.registry.handles_for(&task.recipient_id);
        if handles.is_empty() {
            return Outcome::Terminal("no active session".to_string());
        }

        let frame = envelope.wire_body().to_string();
        let mut accepted = 0usize;

        for handle in &handles {
            match handle.try_push(frame.clone()) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        connection_id = %handle.connection_id,
                        recipient_id = %task.recipient_id,
                        "session send buffer full, frame dropped for this handle"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    // Transport went away without an unregister; clean up.
                    self.registry.unregister(&handle.connection_id);
                }
            }
        }

        if accepted > 0 {
            debug!(
                task_id = %task.task_id,
                sessions = accepted,
                "pushed notification frame"
            );
            Outcome::Succeeded
        } else {
            Outcome::Retryable("all live sessions rejected the frame".to_string())
        }
    }
}
