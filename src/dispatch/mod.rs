//! Event dispatch core.
//!
//! Turns domain occurrences (plot events, recommendations, threshold
//! crossings, messages) into per-recipient, per-channel delivery tasks and
//! drives each task to a terminal outcome with retries and a full audit
//! ledger.

pub mod channels;
pub mod envelope;
pub mod registry;
pub mod routing;
pub mod scheduler;
pub mod service;
pub mod task;
pub mod worker;

pub use channels::{ChannelAdapter, ChannelType, Outcome};
pub use envelope::{EnvelopeBuilder, EventType, NotificationEnvelope};
pub use registry::{SessionHandle, SessionRegistry};
pub use routing::RoutingTable;
pub use scheduler::{BackoffPolicy, DeliveryScheduler};
pub use service::{DeliveryStatus, DispatchService};
pub use task::{DeliveryRecord, DeliveryTask, TaskState};
pub use worker::DispatchWorkerPool;
