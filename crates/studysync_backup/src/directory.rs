//! Backup directory handles.
//!
//! A [`BackupDirectory`] is a user-granted place where snapshot files live.
//! The service only ever talks to this trait, so the platform handle (a
//! filesystem path, a sandboxed picker grant, an in-memory map for tests) is
//! an adapter detail.

use crate::error::{BackupError, BackupResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Access state of a directory grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryPermission {
    /// Reads and writes are allowed.
    Granted,
    /// The user has to confirm access again.
    Prompt,
    /// Access was refused or revoked.
    Denied,
}

/// A directory that holds backup files.
///
/// # Invariants
///
/// - `write` is atomic: readers see the old file or the complete new one
/// - `list` returns plain file names, sorted
pub trait BackupDirectory: Send + Sync {
    /// Human-readable name of the directory.
    fn name(&self) -> String;

    /// Current access state.
    fn permission(&self) -> DirectoryPermission;

    /// Lists file names in the directory.
    fn list(&self) -> BackupResult<Vec<String>>;

    /// Reads a file.
    fn read(&self, file_name: &str) -> BackupResult<Vec<u8>>;

    /// Creates or replaces a file.
    fn write(&self, file_name: &str, bytes: &[u8]) -> BackupResult<()>;

    /// Deletes a file.
    fn remove(&self, file_name: &str) -> BackupResult<()>;
}

/// Lets the user pick a backup directory.
pub trait DirectoryPicker {
    /// Shows the picker. `Ok(None)` means the user cancelled.
    fn pick(&self) -> BackupResult<Option<Arc<dyn BackupDirectory>>>;
}

/// A picker that always returns the same directory.
pub struct FixedPicker {
    directory: Option<Arc<dyn BackupDirectory>>,
}

impl FixedPicker {
    /// A picker returning `directory`.
    pub fn new(directory: Arc<dyn BackupDirectory>) -> Self {
        Self {
            directory: Some(directory),
        }
    }

    /// A picker the user always cancels.
    pub fn cancelled() -> Self {
        Self { directory: None }
    }
}

impl DirectoryPicker for FixedPicker {
    fn pick(&self) -> BackupResult<Option<Arc<dyn BackupDirectory>>> {
        Ok(self.directory.clone())
    }
}

fn check_file_name(file_name: &str) -> BackupResult<()> {
    let valid = !file_name.is_empty()
        && !file_name.starts_with('.')
        && !file_name.contains(['/', '\\'])
        && file_name != "..";
    if valid {
        Ok(())
    } else {
        Err(BackupError::validation(format!("invalid file name {file_name:?}")))
    }
}

/// A backup directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsBackupDirectory {
    path: PathBuf,
}

impl FsBackupDirectory {
    /// Wraps an existing directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Wraps a directory, creating it if missing.
    pub fn create(path: impl Into<PathBuf>) -> BackupResult<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// Returns the directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> BackupResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> BackupResult<()> {
        Ok(())
    }
}

impl BackupDirectory for FsBackupDirectory {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn permission(&self) -> DirectoryPermission {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => {
                DirectoryPermission::Granted
            }
            _ => DirectoryPermission::Denied,
        }
    }

    fn list(&self) -> BackupResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, file_name: &str) -> BackupResult<Vec<u8>> {
        check_file_name(file_name)?;
        Ok(fs::read(self.path.join(file_name))?)
    }

    /// Writes through a temporary file, then renames it into place and
    /// syncs the directory.
    fn write(&self, file_name: &str, bytes: &[u8]) -> BackupResult<()> {
        check_file_name(file_name)?;
        let target = self.path.join(file_name);
        let temp = self.path.join(format!(".{file_name}.tmp"));

        let result = (|| -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&temp, &target)
        })();

        if let Err(err) = result {
            let _ = fs::remove_file(&temp);
            return Err(BackupError::from_write(err, file_name));
        }
        self.sync_directory()
    }

    fn remove(&self, file_name: &str) -> BackupResult<()> {
        check_file_name(file_name)?;
        fs::remove_file(self.path.join(file_name))?;
        self.sync_directory()
    }
}

/// An in-memory backup directory for tests and previews.
pub struct MemoryBackupDirectory {
    name: String,
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    permission: RwLock<DirectoryPermission>,
    quota_bytes: RwLock<Option<usize>>,
}

impl MemoryBackupDirectory {
    /// Creates an empty, granted directory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: RwLock::new(BTreeMap::new()),
            permission: RwLock::new(DirectoryPermission::Granted),
            quota_bytes: RwLock::new(None),
        }
    }

    /// Changes the access state, e.g. to simulate a revoked grant.
    pub fn set_permission(&self, permission: DirectoryPermission) {
        *self.permission.write() = permission;
    }

    /// Limits the total size of stored files.
    pub fn set_quota_bytes(&self, quota: Option<usize>) {
        *self.quota_bytes.write() = quota;
    }

    /// Places a file directly, bypassing permission checks.
    pub fn insert(&self, file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.write().insert(file_name.into(), bytes.into());
    }

    /// Returns the stored file names.
    pub fn file_names(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    fn ensure_granted(&self) -> BackupResult<()> {
        match *self.permission.read() {
            DirectoryPermission::Granted => Ok(()),
            other => Err(BackupError::PermissionDenied(format!(
                "{} is {other:?}",
                self.name
            ))),
        }
    }
}

impl BackupDirectory for MemoryBackupDirectory {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn permission(&self) -> DirectoryPermission {
        *self.permission.read()
    }

    fn list(&self) -> BackupResult<Vec<String>> {
        self.ensure_granted()?;
        Ok(self.file_names())
    }

    fn read(&self, file_name: &str) -> BackupResult<Vec<u8>> {
        self.ensure_granted()?;
        self.files.read().get(file_name).cloned().ok_or_else(|| {
            BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{file_name} not found"),
            ))
        })
    }

    fn write(&self, file_name: &str, bytes: &[u8]) -> BackupResult<()> {
        self.ensure_granted()?;
        check_file_name(file_name)?;
        let mut files = self.files.write();
        if let Some(quota) = *self.quota_bytes.read() {
            let others: usize = files
                .iter()
                .filter(|(name, _)| name.as_str() != file_name)
                .map(|(_, data)| data.len())
                .sum();
            if others + bytes.len() > quota {
                return Err(BackupError::StorageQuota {
                    target: file_name.to_string(),
                });
            }
        }
        files.insert(file_name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, file_name: &str) -> BackupResult<()> {
        self.ensure_granted()?;
        self.files.write().remove(file_name);
        Ok(())
    }
}
