//! Sync error handling
//!
//! Typed errors for the synchronization protocol, its transports and the
//! data adapter behind the server.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::storage::AdapterError;

/// Errors that can occur while synchronizing a document
#[derive(Error, Debug)]
pub enum SyncError {
    /// Operation attempted before `join` completed
    #[error("No sync session for room '{room}'. Join the room first.")]
    InvalidSession { room: String },

    /// Inbound batch does not match the receiver's versions
    #[error("Rejected edit: expected version {expected}, received {received}")]
    RejectedEdit { expected: u64, received: u64 },

    /// Data adapter failed to load or store a room document
    #[error("Data adapter failed for room '{room}': {source}")]
    AdapterFailure {
        room: String,
        #[source]
        source: AdapterError,
    },

    /// Diff engine could not apply a diff
    #[error("Failed to apply diff: {0}")]
    Patch(String),

    /// The connection went away while a request was outstanding
    #[error("Connection closed")]
    ConnectionClosed,

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer answered with an error
    #[error("Remote error: {0}")]
    Remote(String),

    /// Message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Check if this error is recoverable by running another sync cycle
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::RejectedEdit { .. } | SyncError::Transport(_) | SyncError::Patch(_)
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::InvalidSession { .. } => Some("Initialize the client before syncing."),
            SyncError::RejectedEdit { .. } => {
                Some("Schedule another sync cycle. If rejections persist, re-join the room.")
            }
            SyncError::ConnectionClosed => Some("Reconnect and re-join the room."),
            SyncError::AdapterFailure { source, .. } => source.recovery_suggestion(),
            _ => None,
        }
    }
}

impl From<tungstenite::Error> for SyncError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                SyncError::ConnectionClosed
            }
            other => SyncError::Transport(other.to_string()),
        }
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_edit_display() {
        let err = SyncError::RejectedEdit {
            expected: 3,
            received: 2,
        };

        let msg = err.to_string();
        assert!(msg.contains("expected version 3"));
        assert!(msg.contains("received 2"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_invalid_session_suggestion() {
        let err = SyncError::InvalidSession {
            room: "notes".to_string(),
        };

        assert!(err.to_string().contains("notes"));
        assert!(!err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_adapter_failure_keeps_source() {
        let err = SyncError::AdapterFailure {
            room: "notes".to_string(),
            source: AdapterError::Unavailable("backend offline".to_string()),
        };

        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("backend offline"));
    }

    #[test]
    fn test_closed_connection_conversion() {
        let err: SyncError = tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, SyncError::ConnectionClosed));
    }
}
