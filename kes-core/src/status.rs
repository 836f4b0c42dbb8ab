//! Observable engine status shared between the supervisor and its callers.
//!
//! A single [`StatusStore`] is constructed at the composition root and a
//! handle is passed to every component that reports progress. Only the
//! current value is kept; later writes overwrite earlier ones.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connection state of the locally supervised engine server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum ServerStatus {
    /// No engine process is running or reachable.
    Disconnected,
    /// The engine is starting up or a repository session is being established.
    Connecting,
    /// The engine answered and a repository session is open.
    Connected,
    /// A fatal path was hit; the message is always non-empty.
    Error(String),
}

impl ServerStatus {
    /// Whether this status carries an error message.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// Single-value status store with change notifications.
///
/// Writes are atomic single-value replacements (last write wins). Readers
/// either take a snapshot with [`StatusStore::get`] or subscribe for change
/// notifications with [`StatusStore::subscribe`].
#[derive(Clone)]
pub struct StatusStore {
    sender: watch::Sender<ServerStatus>,
}

impl StatusStore {
    /// Create a new store initialized to [`ServerStatus::Disconnected`].
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(ServerStatus::Disconnected);
        Self { sender }
    }

    /// Replace the current status.
    pub fn set(&self, status: ServerStatus) {
        self.sender.send_replace(status);
    }

    /// Snapshot of the current status.
    pub fn get(&self) -> ServerStatus {
        self.sender.borrow().clone()
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.sender.subscribe()
    }

    /// Transition to [`ServerStatus::Error`] with a guaranteed non-empty message.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let message = if message.trim().is_empty() {
            "unknown engine error".to_string()
        } else {
            message
        };
        self.set(ServerStatus::Error(message));
    }

    /// Clear a pending error, returning to [`ServerStatus::Disconnected`].
    ///
    /// A no-op when the current status is not an error.
    pub fn clear_error(&self) {
        self.sender.send_if_modified(|status| {
            if status.is_error() {
                *status = ServerStatus::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
