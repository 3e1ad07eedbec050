//! Repositories for the dispatch core.

mod envelope;
mod inbox;
mod ledger;
mod task;

pub use envelope::{EnvelopeRepository, SqlxEnvelopeRepository};
pub use inbox::{DurableNotification, InboxRepository, SqlxInboxRepository};
pub use ledger::{LedgerRepository, SqlxLedgerRepository};
pub use task::{SqlxTaskRepository, TaskRepository};
