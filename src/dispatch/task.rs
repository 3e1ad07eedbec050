//! Delivery tasks and ledger records.
//!
//! A delivery task is the unit of work for delivering one envelope to one
//! recipient via one channel. Its state machine:
//!
//! `pending -> in_flight -> succeeded | failed_terminal`, with retryable
//! failures re-parking the task as `pending` (incremented attempt count,
//! recomputed `next_attempt_at`) until the attempt ceiling is reached.
//!
//! Exactly one task may be in flight at a time for a given
//! `(envelope_id, recipient_id, channel_type)` key; the claim is an atomic
//! check-and-set in the task store.

use serde::{Deserialize, Serialize};

use crate::dispatch::channels::ChannelType;

/// Delivery task state.
///
/// `FailedRetryable` never appears on a stored task (the store re-parks
/// retryable failures as `Pending`); it appears in ledger records.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "succeeded" => Some(Self::Succeeded),
            "failed_retryable" => Some(Self::FailedRetryable),
            "failed_terminal" => Some(Self::FailedTerminal),
            _ => None,
        }
    }

    /// Whether the state is terminal (no further attempts).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal)
    }
}

/// One unit of delivery work: one envelope, one recipient, one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub task_id: String,
    pub envelope_id: String,
    pub recipient_id: String,
    pub channel_type: ChannelType,
    pub state: TaskState,
    pub attempt_count: u32,
    /// Epoch milliseconds; the task is due once this is in the past.
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeliveryTask {
    /// New pending task, due immediately.
    pub fn new(
        envelope_id: impl Into<String>,
        recipient_id: impl Into<String>,
        channel_type: ChannelType,
        now_ms: i64,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            envelope_id: envelope_id.into(),
            recipient_id: recipient_id.into(),
            channel_type,
            state: TaskState::Pending,
            attempt_count: 0,
            next_attempt_at: now_ms,
            last_error: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}

/// Append-only ledger entry: one per recorded attempt outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Ledger row id; 0 until persisted.
    pub id: i64,
    pub task_id: String,
    pub envelope_id: String,
    pub recipient_id: String,
    pub channel_type: ChannelType,
    /// `succeeded`, `failed_retryable` or `failed_terminal`.
    pub outcome: TaskState,
    pub attempt_count: u32,
    pub error: Option<String>,
    /// Recomputed due time for retryable outcomes.
    pub next_attempt_at: Option<i64>,
    pub recorded_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_roundtrip() {
        assert_eq!(TaskState::Pending.as_str(), "pending");
        assert_eq!(TaskState::parse("in_flight"), Some(TaskState::InFlight));
        assert_eq!(TaskState::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::FailedTerminal.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::InFlight.is_terminal());
        assert!(!TaskState::FailedRetryable.is_terminal());
    }

    #[test]
    fn new_task_is_due_immediately() {
        let task = DeliveryTask::new("env-1", "producer-1", ChannelType::WebSocketPush, 1000);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(task.next_attempt_at, 1000);
    }
}
