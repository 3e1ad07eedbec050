//! Session registry for live websocket connections.
//!
//! Thread-safe mapping from recipient identity to live session handles.
//! `handles_for` returns a snapshot, not a live view: callers fan out over
//! the snapshot and must not assume it stays valid. No component outside
//! this module iterates live connections directly.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// One live websocket connection through which push delivery can reach a
/// recipient. Multiple concurrent handles per recipient are allowed
/// (multi-device).
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub recipient_id: String,
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<String>,
}

impl SessionHandle {
    /// Queue a frame on this session without blocking.
    pub fn try_push(&self, frame: String) -> Result<(), mpsc::error::TrySendError<String>> {
        self.sender.try_send(frame)
    }
}

/// Registry of live sessions, keyed by recipient.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Vec<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for a recipient.
    ///
    /// `sender` is the outbound frame queue owned by the transport; the
    /// registry retains no other ownership over the connection.
    pub fn register(
        &self,
        recipient_id: impl Into<String>,
        connection_id: impl Into<String>,
        sender: mpsc::Sender<String>,
    ) {
        let recipient_id = recipient_id.into();
        let connection_id = connection_id.into();
        let handle = SessionHandle {
            recipient_id: recipient_id.clone(),
            connection_id: connection_id.clone(),
            connected_at: Utc::now(),
            sender,
        };

        let mut sessions = self.sessions.write();
        sessions.entry(recipient_id.clone()).or_default().push(handle);
        debug!(recipient_id = %recipient_id, connection_id = %connection_id, "session registered");
    }

    /// Remove a connection. Returns false when it was not registered.
    pub fn unregister(&self, connection_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let mut removed = false;

        sessions.retain(|_, handles| {
            let before = handles.len();
            handles.retain(|h| h.connection_id != connection_id);
            removed |= handles.len() != before;
            !handles.is_empty()
        });

        if removed {
            debug!(connection_id = %connection_id, "session unregistered");
        }
        removed
    }

    /// Snapshot of the live handles for a recipient.
    pub fn handles_for(&self, recipient_id: &str) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .get(recipient_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of live connections.
    pub fn connection_count(&self) -> usize {
        self.sessions.read().values().map(Vec::len).sum()
    }
}
