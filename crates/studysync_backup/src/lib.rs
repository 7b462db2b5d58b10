//! # StudySync Backup
//!
//! Full-database snapshots of a [`LocalStore`](studysync_store::LocalStore):
//! optional password encryption, a user-granted backup directory with
//! rotation, downloads, and merge or replace restores.
//!
//! ## Restoring
//!
//! A replace import wipes every user table and restores the snapshot as it
//! is. A merge import classifies each incoming record against the local one:
//!
//! | Local | Incoming | Action |
//! |-------|----------|--------|
//! | missing | any | add |
//! | present | newer `updatedAt` | update |
//! | present | not newer, same content | unchanged |
//! | present | not newer, different | conflict |
//!
//! Conflicts take a caller-supplied resolution or fall back to
//! last-write-wins. An exact revision tie with no resolution fails the
//! import before anything is written.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use studysync_backup::{BackupConfig, BackupOptions, BackupService, ImportOptions};
//! use studysync_store::{InMemoryStore, Record, LocalStore};
//!
//! let source = Arc::new(InMemoryStore::with_records([Record::new("tasks", "t1", 1)]));
//! let config = BackupConfig::new().with_kdf_iterations(1_000);
//! let download = BackupService::new(config.clone(), source)
//!     .export_backup_download(&BackupOptions::new().with_password("pw"))
//!     .unwrap();
//!
//! let target = Arc::new(InMemoryStore::new());
//! BackupService::new(config, target.clone())
//!     .import_backup_from_file(&download.bytes, &ImportOptions::merge().with_password("pw"))
//!     .unwrap();
//! assert!(target.get("tasks", "t1").unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod crypto;
mod directory;
mod error;
mod merge;
mod service;

pub use codec::{
    BackupCodec, BackupFile, BackupHeader, BackupOptions, BackupPreview, BackupSnapshot,
    FORMAT_VERSION,
};
pub use config::BackupConfig;
pub use crypto::{BackupKey, SnapshotCipher, IV_SIZE, KDF_NAME, SALT_SIZE};
pub use directory::{
    BackupDirectory, DirectoryPermission, DirectoryPicker, FixedPicker, FsBackupDirectory,
    MemoryBackupDirectory,
};
pub use error::{BackupError, BackupResult};
pub use merge::{
    classify, MergeAction, MergeDiffEngine, MergeItem, MergePlan, MergeResolution, RecordDiff,
    TableImpact,
};
pub use service::{
    BackupDownload, BackupService, ImportMode, ImportOptions, ImportReport, SavedBackup,
};
