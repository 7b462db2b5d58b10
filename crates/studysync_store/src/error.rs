//! Error types for store operations.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record or table file could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The persistence layer refused a write because it is full.
    #[error("storage quota exceeded while writing to table {table}")]
    QuotaExceeded {
        /// Table the refused write targeted.
        table: String,
    },

    /// Table name cannot be used by this store.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// The store contents are corrupted.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,
}

impl StoreError {
    /// Returns true if this error means the store refused a write for lack of space.
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}
