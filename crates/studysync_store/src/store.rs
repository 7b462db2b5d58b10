//! Local store trait definition.

use crate::error::StoreResult;
use crate::record::{is_system_table, Record};

/// A per-table record store.
///
/// Stores are dumb containers: they do not validate revision markers or track
/// pending changes. The sync engine and the backup service own those rules.
///
/// # Invariants
///
/// - `put` replaces any record with the same `(table, id)`
/// - `list_all` returns records ordered by id
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait LocalStore: Send + Sync {
    /// Fetches a record by id.
    fn get(&self, table: &str, id: &str) -> StoreResult<Option<Record>>;

    /// Inserts or replaces a record in `record.table`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::QuotaExceeded`](crate::StoreError::QuotaExceeded)
    /// when the persistence layer refuses the write.
    fn put(&self, record: Record) -> StoreResult<()>;

    /// Removes a record. Returns true if it existed.
    fn delete(&self, table: &str, id: &str) -> StoreResult<bool>;

    /// Lists every record in a table, tombstones included.
    fn list_all(&self, table: &str) -> StoreResult<Vec<Record>>;

    /// Lists records whose `updated_at` is strictly greater than `cursor`.
    fn list_changed_since(&self, table: &str, cursor: i64) -> StoreResult<Vec<Record>>;

    /// Lists the names of all non-empty tables, sorted.
    fn tables(&self) -> StoreResult<Vec<String>>;

    /// Removes every record from a table. Returns the number removed.
    fn clear_table(&self, table: &str) -> StoreResult<usize> {
        let records = self.list_all(table)?;
        for record in &records {
            self.delete(table, &record.id)?;
        }
        Ok(records.len())
    }

    /// Counts records in a table.
    fn count(&self, table: &str) -> StoreResult<usize> {
        Ok(self.list_all(table)?.len())
    }
}

/// Lists the app tables of a store, skipping system tables.
pub fn user_tables<S: LocalStore + ?Sized>(store: &S) -> StoreResult<Vec<String>> {
    Ok(store
        .tables()?
        .into_iter()
        .filter(|t| !is_system_table(t))
        .collect())
}
