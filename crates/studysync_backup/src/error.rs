//! Error types for backup operations.

use std::io;
use studysync_store::StoreError;
use thiserror::Error;

/// Result type for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// Errors that can occur while writing, reading or restoring backups.
///
/// Every variant displays a reason suitable for showing to the user.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The file is not a backup this version can read.
    #[error("invalid backup file: {0}")]
    Validation(String),

    /// The backup could not be decrypted with the given password.
    #[error("could not decrypt backup: {0}")]
    Decryption(String),

    /// The backup is encrypted and no password was supplied.
    #[error("this backup is encrypted; a password is required")]
    PasswordRequired,

    /// Access to the backup directory was revoked or refused.
    #[error("permission to the backup directory was denied: {0}")]
    PermissionDenied(String),

    /// No backup directory has been chosen.
    #[error("no backup directory has been chosen")]
    NoDirectory,

    /// Storage refused a write for lack of space.
    #[error("storage quota exceeded while writing {target}")]
    StorageQuota {
        /// What was being written (table or file name).
        target: String,
    },

    /// Two versions of a record carry the same revision and differ.
    #[error("conflicting versions of {table}/{record_id} share revision {updated_at}; choose one to keep")]
    DataConflict {
        /// Table of the record.
        table: String,
        /// Id of the record.
        record_id: String,
        /// The shared revision.
        updated_at: i64,
    },

    /// Another import or export is running.
    #[error("another backup operation is in progress")]
    Busy,

    /// Local store error.
    #[error("store error: {0}")]
    Store(StoreError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BackupError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a decryption error.
    pub fn decryption(message: impl Into<String>) -> Self {
        Self::Decryption(message.into())
    }

    /// Maps an I/O error from writing `target`, detecting a full disk.
    pub fn from_write(err: io::Error, target: impl Into<String>) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull => Self::StorageQuota {
                target: target.into(),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Io(err),
        }
    }
}

impl From<StoreError> for BackupError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QuotaExceeded { table } => BackupError::StorageQuota { target: table },
            other => BackupError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_quota_maps_to_storage_quota() {
        let err: BackupError = StoreError::QuotaExceeded {
            table: "tasks".into(),
        }
        .into();
        assert!(matches!(err, BackupError::StorageQuota { ref target } if target == "tasks"));
    }

    #[test]
    fn write_errors_are_classified() {
        let full = io::Error::new(io::ErrorKind::StorageFull, "disk full");
        assert!(matches!(
            BackupError::from_write(full, "a.json"),
            BackupError::StorageQuota { .. }
        ));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            BackupError::from_write(denied, "a.json"),
            BackupError::PermissionDenied(_)
        ));
    }

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(
            BackupError::PasswordRequired.to_string(),
            "this backup is encrypted; a password is required"
        );
        let err = BackupError::DataConflict {
            table: "tasks".into(),
            record_id: "a".into(),
            updated_at: 7,
        };
        assert!(err.to_string().contains("tasks/a"));
    }
}
