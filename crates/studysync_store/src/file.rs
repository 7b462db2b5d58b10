//! Directory-backed store with one JSON file per table.
//!
//! Layout:
//!
//! ```text
//! <store_dir>/
//! ├─ LOCK            # Advisory lock for single-writer
//! ├─ tasks.json      # One sorted JSON array of records per table
//! └─ _outbox.json
//! ```
//!
//! Tables are loaded once at open and written through on every mutation
//! using write-then-rename, so a crash never leaves a half-written table.

use crate::error::{StoreError, StoreResult};
use crate::record::Record;
use crate::store::LocalStore;
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const TABLE_EXT: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";

/// A persistent store rooted in a directory.
///
/// # Thread Safety
///
/// The store holds an exclusive lock on its directory; only one `FileStore`
/// can be open per directory at a time. Within the process, an internal
/// lock serializes writers.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    tables: RwLock<BTreeMap<String, BTreeMap<String, Record>>>,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store directory and loads every table.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the lock (returns `Locked`)
    /// - A table file cannot be parsed (returns `Corrupted`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> StoreResult<Self> {
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        let mut tables = BTreeMap::new();
        for entry in fs::read_dir(path)? {
            let file_path = entry?.path();
            if file_path.extension().and_then(|e| e.to_str()) != Some(TABLE_EXT) {
                continue;
            }
            let Some(table) = file_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let data = fs::read(&file_path)?;
            let records: Vec<Record> = serde_json::from_slice(&data).map_err(|e| {
                StoreError::Corrupted(format!("{}: {e}", file_path.display()))
            })?;
            let rows: BTreeMap<_, _> = records.into_iter().map(|r| (r.id.clone(), r)).collect();
            debug!(table, rows = rows.len(), "loaded table");
            tables.insert(table.to_string(), rows);
        }

        Ok(Self {
            path: path.to_path_buf(),
            tables: RwLock::new(tables),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.path.join(format!("{table}.{TABLE_EXT}"))
    }

    fn validate_table_name(table: &str) -> StoreResult<()> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(())
        } else {
            Err(StoreError::InvalidTableName(table.to_string()))
        }
    }

    /// Persists one table atomically. Empty tables lose their file.
    fn write_table(&self, table: &str, rows: Option<&BTreeMap<String, Record>>) -> StoreResult<()> {
        let table_path = self.table_path(table);

        let Some(rows) = rows.filter(|r| !r.is_empty()) else {
            if table_path.exists() {
                fs::remove_file(&table_path)?;
                self.sync_directory()?;
            }
            return Ok(());
        };

        let records: Vec<&Record> = rows.values().collect();
        let data = serde_json::to_vec(&records)?;

        let temp_path = self.path.join(format!("{table}.{TABLE_EXT}{TEMP_SUFFIX}"));
        let written = File::create(&temp_path).and_then(|mut file| {
            file.write_all(&data)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(map_write_error(table, e));
        }

        fs::rename(&temp_path, &table_path)?;
        self.sync_directory()?;
        Ok(())
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StoreResult<()> {
        Ok(())
    }
}

fn map_write_error(table: &str, error: io::Error) -> StoreError {
    if error.kind() == io::ErrorKind::StorageFull {
        StoreError::QuotaExceeded {
            table: table.to_string(),
        }
    } else {
        StoreError::Io(error)
    }
}

impl LocalStore for FileStore {
    fn get(&self, table: &str, id: &str) -> StoreResult<Option<Record>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(id))
            .cloned())
    }

    fn put(&self, record: Record) -> StoreResult<()> {
        Self::validate_table_name(&record.table)?;
        let mut tables = self.tables.write();
        let table = record.table.clone();
        let id = record.id.clone();

        let previous = tables
            .entry(table.clone())
            .or_default()
            .insert(id.clone(), record);

        if let Err(e) = self.write_table(&table, tables.get(&table)) {
            // Roll the cache back so memory matches disk.
            if let Some(rows) = tables.get_mut(&table) {
                match previous {
                    Some(prev) => {
                        rows.insert(id, prev);
                    }
                    None => {
                        rows.remove(&id);
                    }
                }
                if rows.is_empty() {
                    tables.remove(&table);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(false);
        };
        if rows.remove(id).is_none() {
            return Ok(false);
        }
        if rows.is_empty() {
            tables.remove(table);
        }
        self.write_table(table, tables.get(table))?;
        Ok(true)
    }

    fn list_all(&self, table: &str) -> StoreResult<Vec<Record>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    fn list_changed_since(&self, table: &str, cursor: i64) -> StoreResult<Vec<Record>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|r| r.updated_at > cursor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn tables(&self) -> StoreResult<Vec<String>> {
        Ok(self.tables.read().keys().cloned().collect())
    }

    fn clear_table(&self, table: &str) -> StoreResult<usize> {
        let mut tables = self.tables.write();
        let removed = tables.remove(table).map(|t| t.len()).unwrap_or(0);
        if removed > 0 {
            self.write_table(table, None)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store
                .put(Record::new("tasks", "t1", 5).with_field("title", "Essay"))
                .unwrap();
            store.put(Record::new("sessions", "s1", 7)).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let record = store.get("tasks", "t1").unwrap().unwrap();
        assert_eq!(record.updated_at, 5);
        assert_eq!(record.payload["title"], "Essay");
        assert_eq!(
            store.tables().unwrap(),
            vec!["sessions".to_string(), "tasks".to_string()]
        );
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(FileStore::open(dir.path()), Err(StoreError::Locked)));
    }

    #[test]
    fn file_delete_last_record_removes_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put(Record::new("tasks", "t1", 1)).unwrap();
        assert!(dir.path().join("tasks.json").exists());

        assert!(store.delete("tasks", "t1").unwrap());
        assert!(!dir.path().join("tasks.json").exists());
        assert!(store.tables().unwrap().is_empty());
    }

    #[test]
    fn file_rejects_unsafe_table_names() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let err = store.put(Record::new("../escape", "x", 1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTableName(_)));
    }

    #[test]
    fn file_corrupted_table_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("tasks.json"), b"{not json").unwrap();
        assert!(matches!(
            FileStore::open(dir.path()),
            Err(StoreError::Corrupted(_))
        ));
    }

    #[test]
    fn file_clear_table() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put(Record::new("tasks", "a", 1)).unwrap();
        store.put(Record::new("tasks", "b", 1)).unwrap();
        assert_eq!(store.clear_table("tasks").unwrap(), 2);
        assert!(!dir.path().join("tasks.json").exists());
    }
}
