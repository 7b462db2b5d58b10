//! Error types for the sync engine.

use studysync_protocol::ProtocolError;
use studysync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A push or pull did not complete within the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store error.
    #[error("store error: {0}")]
    Store(StoreError),

    /// The local store refused a write for lack of space.
    #[error("storage quota exceeded while writing to table {table}")]
    StorageQuota {
        /// Table the refused write targeted.
        table: String,
    },

    /// Engine state could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The remote holds a newer version of the record.
    #[error("data conflict on {table}/{record_id}")]
    DataConflict {
        /// Table of the record.
        table: String,
        /// Id of the record.
        record_id: String,
    },

    /// No unresolved conflict with the given id.
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The device is offline.
    #[error("offline")]
    Offline,

    /// A local write carried an older revision than the stored record.
    #[error("stale write to {table}/{record_id}: stored revision {stored}, attempted {attempted}")]
    StaleWrite {
        /// Table of the record.
        table: String,
        /// Id of the record.
        record_id: String,
        /// Revision currently stored.
        stored: i64,
        /// Revision of the rejected write.
        attempted: i64,
    },

    /// Writes to system tables are not allowed through the engine.
    #[error("table {0:?} is reserved")]
    ReservedTable(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true if this error is a network-level failure.
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Transport { .. } | SyncError::Timeout)
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QuotaExceeded { table } => SyncError::StorageQuota { table },
            other => SyncError::Store(other),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
