//! Dispatch core configuration.
//!
//! All retry and channel behavior is driven by configuration rather than
//! hard-coded constants: backoff base/cap, the attempt ceiling, worker pool
//! sizing and the outbound webhook endpoint all live here, with documented
//! defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum payload size accepted at submission (64 KiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Default backoff base (5s) and cap (5m).
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 300_000;

/// Default delivery attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Configuration for the dispatch core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum payload size in bytes accepted by `submit_event`.
    pub max_payload_bytes: usize,
    /// Maximum delivery attempts per task before it is failed terminally.
    pub max_attempts: u32,
    /// Exponential backoff base in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds.
    pub backoff_cap_ms: u64,
    /// Number of concurrent dispatch workers.
    pub worker_count: usize,
    /// Scheduler poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of due tasks fetched per scheduler poll.
    pub due_batch_size: i64,
    /// Outbound frame buffer per websocket session; a full buffer counts as
    /// a failed send for that handle, never a blocked worker.
    pub session_send_buffer: usize,
    /// Outbound webhook endpoint configuration.
    pub webhook: WebhookEndpointConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
            worker_count: 4,
            poll_interval_ms: 500,
            due_batch_size: 32,
            session_send_buffer: 32,
            webhook: WebhookEndpointConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("DISPATCH_MAX_ATTEMPTS") {
            config.max_attempts = v;
        }
        if let Some(v) = env_parse("DISPATCH_BACKOFF_BASE_MS") {
            config.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("DISPATCH_BACKOFF_CAP_MS") {
            config.backoff_cap_ms = v;
        }
        if let Some(v) = env_parse("DISPATCH_WORKER_COUNT") {
            config.worker_count = v;
        }
        if let Ok(url) = std::env::var("DISPATCH_WEBHOOK_URL") {
            config.webhook.url = url;
        }
        if let Some(v) = env_parse("DISPATCH_WEBHOOK_TIMEOUT_SECS") {
            config.webhook.timeout_secs = v;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Outbound webhook endpoint configuration.
///
/// An empty `url` means no endpoint is configured; tasks routed to the
/// webhook channel then fail terminally instead of retrying forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpointConfig {
    /// Endpoint URL.
    pub url: String,
    /// Per-attempt request timeout in seconds.
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    /// Custom headers added to every request.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Authentication.
    pub auth: Option<WebhookAuth>,
}

fn default_webhook_timeout() -> u64 {
    30
}

impl Default for WebhookEndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: default_webhook_timeout(),
            headers: Vec::new(),
            auth: None,
        }
    }
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    /// Bearer token authentication.
    Bearer { token: String },
    /// Basic authentication.
    Basic { username: String, password: String },
    /// Custom header authentication.
    Header { name: String, value: String },
}

impl DispatchConfig {
    /// Scheduler poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
