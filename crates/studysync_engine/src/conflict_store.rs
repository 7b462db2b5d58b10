//! Durable list of unresolved conflicts.

use crate::error::SyncResult;
use crate::system::{decode, encode, CONFLICTS_TABLE};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use studysync_protocol::SyncConflict;
use studysync_store::LocalStore;

/// Conflicts awaiting resolution, mirrored to the `_conflicts` system table.
///
/// At most one unresolved conflict exists per record; a newer remote
/// observation refreshes the existing entry instead of adding another.
pub struct ConflictStore {
    store: Arc<dyn LocalStore>,
    conflicts: RwLock<BTreeMap<String, SyncConflict>>,
}

impl ConflictStore {
    /// Loads unresolved conflicts from the store.
    pub fn open(store: Arc<dyn LocalStore>) -> SyncResult<Self> {
        let mut conflicts = BTreeMap::new();
        for record in store.list_all(CONFLICTS_TABLE)? {
            let conflict: SyncConflict = decode(record)?;
            if !conflict.resolved {
                conflicts.insert(conflict.id.clone(), conflict);
            }
        }
        Ok(Self {
            store,
            conflicts: RwLock::new(conflicts),
        })
    }

    /// Adds or replaces a conflict.
    pub fn put(&self, conflict: &SyncConflict) -> SyncResult<()> {
        let revision = conflict.created_at.timestamp_millis();
        let record = encode(CONFLICTS_TABLE, conflict.id.clone(), revision, conflict)?;
        self.store.put(record)?;
        self.conflicts
            .write()
            .insert(conflict.id.clone(), conflict.clone());
        Ok(())
    }

    /// Returns a conflict by id.
    pub fn get(&self, id: &str) -> Option<SyncConflict> {
        self.conflicts.read().get(id).cloned()
    }

    /// Returns the unresolved conflict for a record, if any.
    pub fn find_for_record(&self, table: &str, record_id: &str) -> Option<SyncConflict> {
        self.conflicts
            .read()
            .values()
            .find(|c| c.is_for(table, record_id))
            .cloned()
    }

    /// Removes a resolved conflict. Returns true if it existed.
    pub fn remove(&self, id: &str) -> SyncResult<bool> {
        self.store.delete(CONFLICTS_TABLE, id)?;
        Ok(self.conflicts.write().remove(id).is_some())
    }

    /// Unresolved conflicts, oldest first.
    pub fn list(&self) -> Vec<SyncConflict> {
        let mut list: Vec<SyncConflict> = self.conflicts.read().values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Number of unresolved conflicts.
    pub fn len(&self) -> usize {
        self.conflicts.read().len()
    }

    /// Returns true if there is nothing to resolve.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ConflictStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictStore")
            .field("len", &self.len())
            .finish()
    }
}
