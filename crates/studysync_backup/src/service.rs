//! Backup transport: saving, downloading, importing and rotating snapshots.

use crate::codec::{BackupCodec, BackupOptions, BackupPreview, BackupSnapshot};
use crate::config::BackupConfig;
use crate::directory::{BackupDirectory, DirectoryPermission, DirectoryPicker};
use crate::error::{BackupError, BackupResult};
use crate::merge::{MergeDiffEngine, MergeResolution, RecordDiff, TableImpact};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use studysync_store::{user_tables, LocalStore, Record};

/// How an import combines the backup with local data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Classify records and apply adds, updates and resolved conflicts.
    Merge,
    /// Wipe every user table and restore the snapshot verbatim.
    Replace,
}

/// Options for an import.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Merge or replace.
    pub mode: ImportMode,
    /// Password for encrypted backups.
    pub password: Option<String>,
    /// Pre-resolved conflicts keyed by `(table, id)`.
    pub resolutions: BTreeMap<(String, String), MergeResolution>,
}

impl ImportOptions {
    /// Options for a merge import.
    pub fn merge() -> Self {
        Self {
            mode: ImportMode::Merge,
            password: None,
            resolutions: BTreeMap::new(),
        }
    }

    /// Options for a replace import.
    pub fn replace() -> Self {
        Self {
            mode: ImportMode::Replace,
            ..Self::merge()
        }
    }

    /// Sets the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Pre-resolves the conflict on one record.
    pub fn resolve(
        mut self,
        table: impl Into<String>,
        record_id: impl Into<String>,
        resolution: MergeResolution,
    ) -> Self {
        self.resolutions
            .insert((table.into(), record_id.into()), resolution);
        self
    }
}

/// Summary of an applied import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    /// Mode used.
    pub mode: ImportMode,
    /// Records written.
    pub written: usize,
    /// Records removed by a replace wipe.
    pub removed: usize,
    /// Per-table classification (merge only).
    pub impact: Vec<TableImpact>,
}

/// A backup ready to hand to the user as a download.
#[derive(Debug, Clone)]
pub struct BackupDownload {
    /// Suggested file name.
    pub file_name: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

/// Result of saving to the backup directory.
#[derive(Debug, Clone)]
pub struct SavedBackup {
    /// Name of the written file.
    pub file_name: String,
    /// Embedded creation time.
    pub created_at: DateTime<Utc>,
    /// Files removed by rotation.
    pub rotated: Vec<String>,
}

/// Writes, restores and rotates backups of a local store.
///
/// # Concurrency
///
/// One import or export runs at a time; a second one fails with
/// [`BackupError::Busy`] instead of waiting. Saving to the directory and
/// rotation serialize on a separate directory lock.
pub struct BackupService {
    store: Arc<dyn LocalStore>,
    codec: BackupCodec,
    merge: MergeDiffEngine,
    directory: RwLock<Option<Arc<dyn BackupDirectory>>>,
    op_lock: Mutex<()>,
    dir_lock: Mutex<()>,
    last_created_at: Mutex<Option<DateTime<Utc>>>,
}

impl BackupService {
    /// Creates a service over `store`.
    pub fn new(config: BackupConfig, store: Arc<dyn LocalStore>) -> Self {
        Self {
            merge: MergeDiffEngine::new(Arc::clone(&store)),
            store,
            codec: BackupCodec::new(config),
            directory: RwLock::new(None),
            op_lock: Mutex::new(()),
            dir_lock: Mutex::new(()),
            last_created_at: Mutex::new(None),
        }
    }

    /// Returns the codec.
    pub fn codec(&self) -> &BackupCodec {
        &self.codec
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BackupConfig {
        self.codec.config()
    }

    /// Lets the user pick a backup directory.
    ///
    /// Returns false if the user cancelled; the previous choice is kept.
    pub fn choose_backup_directory(&self, picker: &dyn DirectoryPicker) -> BackupResult<bool> {
        let Some(directory) = picker.pick()? else {
            return Ok(false);
        };
        self.set_backup_directory(directory)?;
        Ok(true)
    }

    /// Uses `directory` for saved backups.
    pub fn set_backup_directory(&self, directory: Arc<dyn BackupDirectory>) -> BackupResult<()> {
        let permission = directory.permission();
        if permission != DirectoryPermission::Granted {
            return Err(BackupError::PermissionDenied(format!(
                "{} is {permission:?}",
                directory.name()
            )));
        }
        tracing::info!(directory = %directory.name(), "backup directory chosen");
        *self.directory.write() = Some(directory);
        Ok(())
    }

    /// Returns the chosen directory if access is still granted.
    pub fn user_backup_dir_or_none(&self) -> Option<Arc<dyn BackupDirectory>> {
        self.directory
            .read()
            .as_ref()
            .filter(|dir| dir.permission() == DirectoryPermission::Granted)
            .cloned()
    }

    /// Counts records per user table.
    pub fn local_table_counts(&self) -> BackupResult<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for table in user_tables(self.store.as_ref())? {
            counts.insert(table.clone(), self.store.count(&table)?);
        }
        Ok(counts)
    }

    /// Encodes a backup for download.
    pub fn export_backup_download(&self, options: &BackupOptions) -> BackupResult<BackupDownload> {
        let _op = self.begin_operation()?;
        let file = self
            .codec
            .write_backup_at(self.store.as_ref(), options, self.next_created_at())?;
        Ok(BackupDownload {
            file_name: file.file_name,
            bytes: file.bytes,
        })
    }

    /// Writes a backup into the chosen directory, then rotates old ones.
    pub fn save_backup_to_directory(&self, options: &BackupOptions) -> BackupResult<SavedBackup> {
        let _op = self.begin_operation()?;
        let _dir = self.dir_lock.lock();
        let directory = self.granted_directory()?;

        let existing = directory.list()?;
        let mut created_at = self.next_created_at();
        while existing.contains(&self.codec.file_name(created_at)) {
            created_at = self.next_created_at();
        }

        let file = self
            .codec
            .write_backup_at(self.store.as_ref(), options, created_at)?;
        directory.write(&file.file_name, &file.bytes)?;
        tracing::info!(file = %file.file_name, directory = %directory.name(), "backup saved");

        let rotated = self.rotate_locked(directory.as_ref())?;
        Ok(SavedBackup {
            file_name: file.file_name,
            created_at: file.created_at,
            rotated,
        })
    }

    /// Deletes the oldest snapshots beyond the retention count.
    ///
    /// Returns the removed file names.
    pub fn rotate_backups_now(&self) -> BackupResult<Vec<String>> {
        let _dir = self.dir_lock.lock();
        let directory = self.granted_directory()?;
        self.rotate_locked(directory.as_ref())
    }

    /// Validates a backup file without applying it.
    pub fn validate_backup_file(
        &self,
        bytes: &[u8],
        password: Option<&str>,
    ) -> BackupResult<BackupPreview> {
        self.codec.validate_backup_file(bytes, password)
    }

    /// Counts what a merge import of `bytes` would do per table.
    pub fn estimate_merge_impact(
        &self,
        bytes: &[u8],
        password: Option<&str>,
    ) -> BackupResult<Vec<TableImpact>> {
        let snapshot = self.codec.read_backup(bytes, password)?;
        self.merge.estimate_merge_impact(&snapshot)
    }

    /// Returns up to `n` record diffs of a merge import of `bytes`.
    pub fn sample_merge_diff(
        &self,
        bytes: &[u8],
        n: usize,
        password: Option<&str>,
    ) -> BackupResult<Vec<RecordDiff>> {
        let snapshot = self.codec.read_backup(bytes, password)?;
        self.merge.sample_merge_diff(&snapshot, n)
    }

    /// Restores a backup.
    ///
    /// The file is fully decoded and, for merges, every conflict resolved
    /// before the first write.
    pub fn import_backup_from_file(
        &self,
        bytes: &[u8],
        options: &ImportOptions,
    ) -> BackupResult<ImportReport> {
        let _op = self.begin_operation()?;
        let snapshot = self.codec.read_backup(bytes, options.password.as_deref())?;

        let report = match options.mode {
            ImportMode::Merge => self.merge_import(&snapshot, options)?,
            ImportMode::Replace => self.replace_import(&snapshot)?,
        };
        tracing::info!(
            mode = ?report.mode,
            written = report.written,
            removed = report.removed,
            "backup imported"
        );
        Ok(report)
    }

    fn merge_import(
        &self,
        snapshot: &BackupSnapshot,
        options: &ImportOptions,
    ) -> BackupResult<ImportReport> {
        let plan = self.merge.plan(snapshot)?;
        let writes = plan.resolve(&options.resolutions)?;
        let written = writes.len();
        for record in writes {
            tracing::debug!(table = %record.table, id = %record.id, "merge write");
            self.store.put(record)?;
        }
        Ok(ImportReport {
            mode: ImportMode::Merge,
            written,
            removed: 0,
            impact: plan.impact(),
        })
    }

    fn replace_import(&self, snapshot: &BackupSnapshot) -> BackupResult<ImportReport> {
        let mut previous = Vec::new();
        for table in user_tables(self.store.as_ref())? {
            previous.extend(self.store.list_all(&table)?);
        }
        let removed = previous.len();

        match self.overwrite_user_records(snapshot.records()) {
            Ok(written) => Ok(ImportReport {
                mode: ImportMode::Replace,
                written,
                removed,
                impact: Vec::new(),
            }),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    restoring = previous.len(),
                    "replace import failed, restoring local records"
                );
                if let Err(rollback) = self.overwrite_user_records(previous.iter()) {
                    tracing::error!(error = %rollback, "failed to restore local records");
                }
                Err(err)
            }
        }
    }

    /// Clears every user table and writes `records` in their place.
    fn overwrite_user_records<'a>(
        &self,
        records: impl Iterator<Item = &'a Record>,
    ) -> BackupResult<usize> {
        for table in user_tables(self.store.as_ref())? {
            self.store.clear_table(&table)?;
        }
        let mut written = 0;
        for record in records {
            self.store.put(record.clone())?;
            written += 1;
        }
        Ok(written)
    }

    fn rotate_locked(&self, directory: &dyn BackupDirectory) -> BackupResult<Vec<String>> {
        let mut snapshots = Vec::new();
        for name in directory.list()? {
            if !self.codec.is_own_file_name(&name) {
                continue;
            }
            let header = directory
                .read(&name)
                .and_then(|bytes| self.codec.read_header(&bytes));
            match header {
                Ok(header) => snapshots.push((header.created_at, name)),
                Err(err) => tracing::warn!(file = %name, error = %err, "ignoring unreadable backup"),
            }
        }

        snapshots.sort_by(|a, b| b.cmp(a));
        let retention = self.config().retention.max(1);
        let mut removed = Vec::new();
        for (_, name) in snapshots.into_iter().skip(retention) {
            directory.remove(&name)?;
            tracing::info!(file = %name, "rotated old backup");
            removed.push(name);
        }
        Ok(removed)
    }

    fn begin_operation(&self) -> BackupResult<MutexGuard<'_, ()>> {
        self.op_lock.try_lock().ok_or(BackupError::Busy)
    }

    fn granted_directory(&self) -> BackupResult<Arc<dyn BackupDirectory>> {
        let directory = self
            .directory
            .read()
            .clone()
            .ok_or(BackupError::NoDirectory)?;
        match directory.permission() {
            DirectoryPermission::Granted => Ok(directory),
            other => Err(BackupError::PermissionDenied(format!(
                "{} is {other:?}",
                directory.name()
            ))),
        }
    }

    /// Creation times are strictly increasing so file names never collide.
    fn next_created_at(&self) -> DateTime<Utc> {
        let mut last = self.last_created_at.lock();
        let mut now = Utc::now().trunc_subsecs(3);
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::milliseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryBackupDirectory;
    use studysync_store::{InMemoryStore, Record};

    fn service() -> (Arc<InMemoryStore>, BackupService) {
        let store = Arc::new(InMemoryStore::with_records([
            Record::new("tasks", "a", 1),
            Record::new("_sync_meta", "cursor", 1),
        ]));
        let service = BackupService::new(
            BackupConfig::new().with_kdf_iterations(1_000).with_retention(2),
            store.clone(),
        );
        (store, service)
    }

    #[test]
    fn counts_skip_system_tables() {
        let (_, service) = service();
        let counts = service.local_table_counts().unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["tasks"], 1);
    }

    #[test]
    fn no_directory_vs_denied() {
        let (_, service) = service();
        assert!(matches!(
            service.save_backup_to_directory(&BackupOptions::new()),
            Err(BackupError::NoDirectory)
        ));

        let dir = Arc::new(MemoryBackupDirectory::new("mem"));
        service.set_backup_directory(dir.clone()).unwrap();
        dir.set_permission(DirectoryPermission::Denied);
        assert!(matches!(
            service.save_backup_to_directory(&BackupOptions::new()),
            Err(BackupError::PermissionDenied(_))
        ));
        assert!(service.user_backup_dir_or_none().is_none());
    }

    #[test]
    fn created_at_strictly_increases() {
        let (_, service) = service();
        let a = service.next_created_at();
        let b = service.next_created_at();
        assert!(b > a);
    }

    #[test]
    fn busy_while_operation_held() {
        let (_, service) = service();
        let _guard = service.begin_operation().unwrap();
        assert!(matches!(
            service.export_backup_download(&BackupOptions::new()),
            Err(BackupError::Busy)
        ));
        assert!(matches!(
            service.import_backup_from_file(b"{}", &ImportOptions::merge()),
            Err(BackupError::Busy)
        ));
    }
}
