//! In-memory store for testing.

use crate::error::{StoreError, StoreResult};
use crate::record::{is_system_table, Record};
use crate::store::LocalStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;

type Tables = BTreeMap<String, BTreeMap<String, Record>>;

/// An in-memory record store.
///
/// This store keeps all tables in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral sessions that don't need persistence
///
/// An optional quota caps the number of app records, which lets tests
/// exercise the "persistence layer refused a write" path.
///
/// # Example
///
/// ```rust
/// use studysync_store::{InMemoryStore, LocalStore, Record};
///
/// let store = InMemoryStore::with_quota(1);
/// store.put(Record::new("tasks", "a", 1)).unwrap();
/// assert!(store.put(Record::new("tasks", "b", 1)).is_err());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    quota: RwLock<Option<usize>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that refuses new app records beyond `max_records`.
    #[must_use]
    pub fn with_quota(max_records: usize) -> Self {
        let store = Self::new();
        store.set_quota(Some(max_records));
        store
    }

    /// Creates a store preloaded with records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::new();
        {
            let mut tables = store.tables.write();
            for record in records {
                tables
                    .entry(record.table.clone())
                    .or_default()
                    .insert(record.id.clone(), record);
            }
        }
        store
    }

    /// Changes the record quota. `None` removes the limit.
    pub fn set_quota(&self, max_records: Option<usize>) {
        *self.quota.write() = max_records;
    }

    /// Returns every record of every table, system tables included.
    #[must_use]
    pub fn dump(&self) -> Vec<Record> {
        self.tables
            .read()
            .values()
            .flat_map(|t| t.values().cloned())
            .collect()
    }

    fn user_record_count(tables: &Tables) -> usize {
        tables
            .iter()
            .filter(|(name, _)| !is_system_table(name))
            .map(|(_, t)| t.len())
            .sum()
    }
}

impl LocalStore for InMemoryStore {
    fn get(&self, table: &str, id: &str) -> StoreResult<Option<Record>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(id))
            .cloned())
    }

    fn put(&self, record: Record) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let exists = tables
            .get(&record.table)
            .is_some_and(|t| t.contains_key(&record.id));

        if !exists && !is_system_table(&record.table) {
            if let Some(max) = *self.quota.read() {
                if Self::user_record_count(&tables) >= max {
                    return Err(StoreError::QuotaExceeded {
                        table: record.table,
                    });
                }
            }
        }

        tables
            .entry(record.table.clone())
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let Some(t) = tables.get_mut(table) else {
            return Ok(false);
        };
        let removed = t.remove(id).is_some();
        if t.is_empty() {
            tables.remove(table);
        }
        Ok(removed)
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
        Ok(self
            .tables
            .write()
            .remove(table)
            .map(|t| t.len())
            .unwrap_or(0))
    }
}
