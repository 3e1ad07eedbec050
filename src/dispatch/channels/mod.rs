//! Delivery channels.
//!
//! The channel set is closed: live websocket push, durable record, outbound
//! webhook. Each adapter attempts delivery of one envelope to one recipient
//! and classifies the outcome; only the adapter may decide whether a failure
//! is retryable, the scheduler trusts the classification verbatim.

mod durable;
mod webhook;
mod websocket;

pub use durable::DurableRecordChannel;
pub use webhook::OutboundWebhookChannel;
pub use websocket::WebSocketPushChannel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::dispatch::envelope::NotificationEnvelope;
use crate::dispatch::task::DeliveryTask;

/// Delivery channel types.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    WebSocketPush,
    DurableRecord,
    OutboundWebhook,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocketPush => "web_socket_push",
            Self::DurableRecord => "durable_record",
            Self::OutboundWebhook => "outbound_webhook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "web_socket_push" => Some(Self::WebSocketPush),
            "durable_record" => Some(Self::DurableRecord),
            "outbound_webhook" => Some(Self::OutboundWebhook),
            _ => None,
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Transient failure: timeout, 5xx, connection reset, storage busy.
    Retryable(String),
    /// Permanent failure: rejected payload, unknown recipient, no session.
    Terminal(String),
}

/// Trait for delivery channel adapters.
///
/// `attempt` never propagates an error: anything unexpected inside an
/// adapter classifies as [`Outcome::Retryable`] with a generic tag rather
/// than being dropped. Per-attempt timeouts are owned by the adapter.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel this adapter serves.
    fn channel_type(&self) -> ChannelType;

    /// Attempt delivery of `envelope` for `task` and classify the outcome.
    async fn attempt(&self, task: &DeliveryTask, envelope: &NotificationEnvelope) -> Outcome;
}

/// Lookup table mapping each channel type to its adapter.
#[derive(Clone)]
pub struct AdapterSet {
    push: Arc<dyn ChannelAdapter>,
    durable: Arc<dyn ChannelAdapter>,
    webhook: Arc<dyn ChannelAdapter>,
}

impl AdapterSet {
    pub fn new(
        push: Arc<dyn ChannelAdapter>,
        durable: Arc<dyn ChannelAdapter>,
        webhook: Arc<dyn ChannelAdapter>,
    ) -> Self {
        Self {
            push,
            durable,
            webhook,
        }
    }

    pub fn adapter_for(&self, channel_type: ChannelType) -> &dyn ChannelAdapter {
        match channel_type {
            ChannelType::WebSocketPush => self.push.as_ref(),
            ChannelType::DurableRecord => self.durable.as_ref(),
            ChannelType::OutboundWebhook => self.webhook.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_roundtrip() {
        assert_eq!(ChannelType::WebSocketPush.as_str(), "web_socket_push");
        assert_eq!(
            ChannelType::parse("durable_record"),
            Some(ChannelType::DurableRecord)
        );
        assert_eq!(ChannelType::parse("email"), None);
    }
}
