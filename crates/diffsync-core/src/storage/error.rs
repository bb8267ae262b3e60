//! Data adapter error handling
//!
//! Typed errors for loading and storing room documents, with descriptive
//! messages and recovery suggestions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or storing a room document
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Failed to create the rooms directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to read file
    #[error("Failed to read '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write file
    #[error("Failed to write '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Stored document is not valid JSON
    #[error("Invalid document format in '{path}': {details}")]
    InvalidFormat { path: PathBuf, details: String },

    /// File not found (when expected to exist)
    #[error("File not found: '{path}'")]
    NotFound { path: PathBuf },

    /// Atomic write failed during rename
    #[error("Atomic write failed: could not rename '{from}' to '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Backend cannot serve requests right now
    #[error("Data adapter unavailable: {0}")]
    Unavailable(String),
}

impl AdapterError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => AdapterError::PermissionDenied {
                path,
                source: error,
            },
            io::ErrorKind::NotFound => AdapterError::NotFound { path },
            _ if is_disk_full_error(&error) => AdapterError::DiskFull {
                path,
                source: error,
            },
            _ => AdapterError::WriteError {
                path,
                source: error,
            },
        }
    }

    /// Like `from_io`, for errors raised while reading
    pub fn from_read(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound => {
                Self::from_io(error, path)
            }
            _ => AdapterError::ReadError {
                path,
                source: error,
            },
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AdapterError::DiskFull { .. }
                | AdapterError::PermissionDenied { .. }
                | AdapterError::Unavailable(_)
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            AdapterError::DiskFull { .. } => Some("Free up disk space and try again."),
            AdapterError::PermissionDenied { .. } => {
                Some("Check file and directory permissions. You may need to run with different permissions or change ownership.")
            }
            AdapterError::InvalidFormat { .. } => {
                Some("Fix or remove the room file. It will be recreated as an empty document.")
            }
            AdapterError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            AdapterError::Unavailable(_) => Some("Retry once the storage backend is reachable."),
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for data adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;
