//! Outbound webhook channel.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::config::{WebhookAuth, WebhookEndpointConfig};
use crate::dispatch::channels::{ChannelAdapter, ChannelType, Outcome};
use crate::dispatch::envelope::NotificationEnvelope;
use crate::dispatch::task::DeliveryTask;
use crate::{Error, Result};

/// POSTs the envelope wire body to a configured external endpoint.
///
/// Every request carries an `Idempotency-Key` header set to the task id so
/// the receiving side can deduplicate redelivered attempts.
pub struct OutboundWebhookChannel {
    config: WebhookEndpointConfig,
    client: Client,
}

impl OutboundWebhookChannel {
    pub fn new(config: WebhookEndpointConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("failed to build webhook client: {}", e)))?;

        Ok(Self { config, client })
    }
}

/// Map an HTTP status to a delivery outcome.
///
/// 2xx succeeds. 429 and 5xx are retryable (rate limiting and server
/// trouble are transient). Any other 4xx means the endpoint rejected this
/// request and will keep rejecting it, so it fails terminally.
fn classify_status(status: StatusCode) -> Outcome {
    if status.is_success() {
        Outcome::Succeeded
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Outcome::Retryable(format!("HTTP {}", status.as_u16()))
    } else {
        Outcome::Terminal(format!("HTTP {}", status.as_u16()))
    }
}

#[async_trait]
impl ChannelAdapter for OutboundWebhookChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::OutboundWebhook
    }

    async fn attempt(&self, task: &DeliveryTask, envelope: &NotificationEnvelope) -> Outcome {
        if self.config.url.is_empty() {
            return Outcome::Terminal("webhook endpoint not configured".to_string());
        }

        let mut request = self
            .client
            .post(&self.config.url)
            .header("Idempotency-Key", &task.task_id)
            .json(&envelope.wire_body());

        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        match &self.config.auth {
            Some(WebhookAuth::Bearer { token }) => {
                request = request.bearer_auth(token);
            }
            Some(WebhookAuth::Basic { username, password }) => {
                request = request.basic_auth(username, Some(password));
            }
            Some(WebhookAuth::Header { name, value }) => {
                request = request.header(name, value);
            }
            None => {}
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                debug!(
                    task_id = %task.task_id,
                    status = status.as_u16(),
                    "webhook attempt finished"
                );
                classify_status(status)
            }
            // Timeouts, connection resets, DNS failures.
            Err(e) => Outcome::Retryable(format!("request failed: {}", e)),
        }
    }
}
