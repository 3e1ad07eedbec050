//! Event dispatch core for an agricultural campaign management platform.
//!
//! Domain services submit occurrences (plot events, advisor recommendations,
//! cost threshold crossings, messages) and this crate fans them out to
//! recipients over live websocket push, a durable per-recipient inbox and an
//! outbound webhook, with per-task retry state and a complete delivery
//! ledger.

pub mod api;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
