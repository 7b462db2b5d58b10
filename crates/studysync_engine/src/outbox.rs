//! Durable queue of local mutations awaiting remote acknowledgement.

use crate::error::SyncResult;
use crate::system::{decode, encode, OUTBOX_TABLE};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use studysync_protocol::{PendingChange, PushState};
use studysync_store::LocalStore;
use tracing::debug;

/// The outbox of pending local changes.
///
/// Entries are kept in memory and mirrored to the `_outbox` system table
/// after every transition, so a restart resumes where it stopped.
///
/// # Invariants
///
/// - Ids are assigned in append order and never reused
/// - Entries for one record are pushed in id order
/// - An entry leaves the outbox only through [`Outbox::remove`] or
///   [`Outbox::remove_for_record`]
pub struct Outbox {
    store: Arc<dyn LocalStore>,
    entries: RwLock<BTreeMap<u64, PendingChange>>,
    next_id: RwLock<u64>,
}

impl Outbox {
    /// Loads the outbox from the store.
    ///
    /// Entries persisted mid-push are returned to `Pending`.
    pub fn open(store: Arc<dyn LocalStore>) -> SyncResult<Self> {
        let mut entries = BTreeMap::new();
        for record in store.list_all(OUTBOX_TABLE)? {
            let mut change: PendingChange = decode(record)?;
            if change.state == PushState::Pushing {
                change.state = PushState::Pending;
            }
            entries.insert(change.id, change);
        }
        let next_id = entries.keys().next_back().map_or(1, |id| id + 1);
        debug!(entries = entries.len(), next_id, "outbox loaded");

        Ok(Self {
            store,
            entries: RwLock::new(entries),
            next_id: RwLock::new(next_id),
        })
    }

    /// Appends a change and returns its assigned id.
    pub fn append(&self, mut change: PendingChange) -> SyncResult<u64> {
        let mut next_id = self.next_id.write();
        change.id = *next_id;
        self.persist(&change)?;
        *next_id += 1;

        let id = change.id;
        debug!(id, table = %change.table, record_id = %change.record_id, op = change.op.as_str(), "change queued");
        self.entries.write().insert(id, change);
        Ok(id)
    }

    /// Returns an entry by id.
    pub fn get(&self, id: u64) -> Option<PendingChange> {
        self.entries.read().get(&id).cloned()
    }

    /// Stores a transitioned entry.
    pub fn update(&self, change: &PendingChange) -> SyncResult<()> {
        self.persist(change)?;
        self.entries.write().insert(change.id, change.clone());
        Ok(())
    }

    /// Removes an acknowledged or retired entry.
    pub fn remove(&self, id: u64) -> SyncResult<bool> {
        self.store.delete(OUTBOX_TABLE, &Self::key(id))?;
        Ok(self.entries.write().remove(&id).is_some())
    }

    /// Removes every entry touching a record. Returns the number removed.
    pub fn remove_for_record(&self, table: &str, record_id: &str) -> SyncResult<usize> {
        let ids: Vec<u64> = self
            .for_record(table, record_id)
            .into_iter()
            .map(|c| c.id)
            .collect();
        for id in &ids {
            self.remove(*id)?;
        }
        Ok(ids.len())
    }

    /// Entries touching a record, oldest first.
    pub fn for_record(&self, table: &str, record_id: &str) -> Vec<PendingChange> {
        self.entries
            .read()
            .values()
            .filter(|c| c.touches(table, record_id))
            .cloned()
            .collect()
    }

    /// Ids a drain starting at `now` should push, in order.
    ///
    /// An entry that is not ready blocks every later entry for the same
    /// record, so per-record order is preserved across backoff and conflicts.
    pub fn drain_plan(&self, now: DateTime<Utc>) -> Vec<u64> {
        let entries = self.entries.read();
        let mut blocked: HashSet<(&str, &str)> = HashSet::new();
        let mut plan = Vec::new();

        for change in entries.values() {
            let key = (change.table.as_str(), change.record_id.as_str());
            if blocked.contains(&key) {
                continue;
            }
            if change.is_ready(now) {
                plan.push(change.id);
            } else {
                blocked.insert(key);
            }
        }
        plan
    }

    /// All entries in id order.
    pub fn entries(&self) -> Vec<PendingChange> {
        self.entries.read().values().cloned().collect()
    }

    /// Number of entries not yet acknowledged.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, change: &PendingChange) -> SyncResult<()> {
        let revision = i64::try_from(change.id).unwrap_or(i64::MAX);
        let record = encode(OUTBOX_TABLE, Self::key(change.id), revision, change)?;
        self.store.put(record)?;
        Ok(())
    }

    // Zero-padded so the store's id ordering matches append order.
    fn key(id: u64) -> String {
        format!("{id:020}")
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox").field("len", &self.len()).finish()
    }
}
