//! Classification of incoming snapshot records against the local store.

use crate::codec::BackupSnapshot;
use crate::error::{BackupError, BackupResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use studysync_store::{LocalStore, Record};

/// How a merge restore treats one incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MergeAction {
    /// No local record with this id.
    Add,
    /// The incoming record is newer.
    Update,
    /// Not newer, and payload and deleted flag are identical.
    Unchanged,
    /// Not newer, but different.
    Conflict,
}

impl MergeAction {
    /// Returns a lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeAction::Add => "add",
            MergeAction::Update => "update",
            MergeAction::Unchanged => "unchanged",
            MergeAction::Conflict => "conflict",
        }
    }
}

/// Classifies `incoming` against the local version of the same record.
pub fn classify(local: Option<&Record>, incoming: &Record) -> MergeAction {
    match local {
        None => MergeAction::Add,
        Some(local) if incoming.updated_at > local.updated_at => MergeAction::Update,
        Some(local) if incoming.same_content(local) => MergeAction::Unchanged,
        Some(_) => MergeAction::Conflict,
    }
}

/// Caller's choice for a conflicting record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResolution {
    /// Keep the local record.
    KeepLocal,
    /// Overwrite with the incoming record.
    TakeIncoming,
}

/// Per-table merge impact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableImpact {
    /// Table name.
    pub table: String,
    /// Records that would be added.
    pub adds: usize,
    /// Records that would be overwritten by newer versions.
    pub updates: usize,
    /// Records already identical.
    pub unchanged: usize,
    /// Records needing a resolution.
    pub conflicts: usize,
}

impl TableImpact {
    fn count(&mut self, action: MergeAction) {
        match action {
            MergeAction::Add => self.adds += 1,
            MergeAction::Update => self.updates += 1,
            MergeAction::Unchanged => self.unchanged += 1,
            MergeAction::Conflict => self.conflicts += 1,
        }
    }
}

/// A single record diff.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDiff {
    /// Table name.
    pub table: String,
    /// Record id.
    pub record_id: String,
    /// Classification.
    pub action: MergeAction,
    /// Local revision, if the record exists locally.
    pub local_updated_at: Option<i64>,
    /// Incoming revision.
    pub incoming_updated_at: i64,
    /// Payload keys that differ.
    pub changed_fields: Vec<String>,
}

/// A classified incoming record.
#[derive(Debug, Clone)]
pub struct MergeItem {
    /// Classification.
    pub action: MergeAction,
    /// Local version, if any.
    pub local: Option<Record>,
    /// Incoming version.
    pub incoming: Record,
}

/// Every incoming record of a snapshot, classified.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    /// Items in table then id order.
    pub items: Vec<MergeItem>,
}

impl MergePlan {
    /// Summarizes the plan per table.
    pub fn impact(&self) -> Vec<TableImpact> {
        let mut tables: BTreeMap<&str, TableImpact> = BTreeMap::new();
        for item in &self.items {
            tables
                .entry(item.incoming.table.as_str())
                .or_insert_with(|| TableImpact {
                    table: item.incoming.table.clone(),
                    ..TableImpact::default()
                })
                .count(item.action);
        }
        tables.into_values().collect()
    }

    /// Returns up to `n` diffs, non-unchanged first, each group in table/id order.
    pub fn sample(&self, n: usize) -> Vec<RecordDiff> {
        let changed = self
            .items
            .iter()
            .filter(|item| item.action != MergeAction::Unchanged);
        let unchanged = self
            .items
            .iter()
            .filter(|item| item.action == MergeAction::Unchanged);

        changed
            .chain(unchanged)
            .take(n)
            .map(|item| RecordDiff {
                table: item.incoming.table.clone(),
                record_id: item.incoming.id.clone(),
                action: item.action,
                local_updated_at: item.local.as_ref().map(|l| l.updated_at),
                incoming_updated_at: item.incoming.updated_at,
                changed_fields: match &item.local {
                    Some(local) => local.changed_fields(&item.incoming),
                    None => item.incoming.payload.keys().cloned().collect(),
                },
            })
            .collect()
    }

    /// Picks the records to write for a merge import.
    ///
    /// Adds and updates are always written. A conflict uses the caller's
    /// resolution if one is given, otherwise the newer side wins; an exact
    /// revision tie without a resolution is an error. Nothing is written
    /// here, so an error leaves the store untouched.
    pub fn resolve(
        &self,
        resolutions: &BTreeMap<(String, String), MergeResolution>,
    ) -> BackupResult<Vec<Record>> {
        let mut writes = Vec::new();
        for item in &self.items {
            let write = match item.action {
                MergeAction::Add | MergeAction::Update => true,
                MergeAction::Unchanged => false,
                MergeAction::Conflict => {
                    let key = (item.incoming.table.clone(), item.incoming.id.clone());
                    match (resolutions.get(&key), &item.local) {
                        (Some(MergeResolution::TakeIncoming), _) => true,
                        (Some(MergeResolution::KeepLocal), _) => false,
                        (None, Some(local)) if local.updated_at == item.incoming.updated_at => {
                            return Err(BackupError::DataConflict {
                                table: key.0,
                                record_id: key.1,
                                updated_at: local.updated_at,
                            });
                        }
                        (None, Some(local)) => item.incoming.updated_at > local.updated_at,
                        (None, None) => true,
                    }
                }
            };
            if write {
                writes.push(item.incoming.clone());
            }
        }
        Ok(writes)
    }
}

/// Compares snapshots with the local store.
pub struct MergeDiffEngine {
    store: Arc<dyn LocalStore>,
}

impl MergeDiffEngine {
    /// Creates an engine over `store`.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Classifies every record of `snapshot`. Read-only.
    pub fn plan(&self, snapshot: &BackupSnapshot) -> BackupResult<MergePlan> {
        let mut items = Vec::with_capacity(snapshot.record_count());
        for (table, records) in &snapshot.tables {
            let local: BTreeMap<String, Record> = self
                .store
                .list_all(table)?
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect();

            let mut incoming: Vec<&Record> = records.iter().collect();
            incoming.sort_by(|a, b| a.id.cmp(&b.id));
            for record in incoming {
                let local = local.get(&record.id).cloned();
                items.push(MergeItem {
                    action: classify(local.as_ref(), record),
                    local,
                    incoming: record.clone(),
                });
            }
        }
        Ok(MergePlan { items })
    }

    /// Counts adds, updates, unchanged records and conflicts per table.
    pub fn estimate_merge_impact(&self, snapshot: &BackupSnapshot) -> BackupResult<Vec<TableImpact>> {
        Ok(self.plan(snapshot)?.impact())
    }

    /// Returns up to `n` record diffs.
    pub fn sample_merge_diff(&self, snapshot: &BackupSnapshot, n: usize) -> BackupResult<Vec<RecordDiff>> {
        Ok(self.plan(snapshot)?.sample(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use studysync_store::InMemoryStore;

    fn snapshot(records: Vec<Record>) -> BackupSnapshot {
        let mut tables: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for record in records {
            tables.entry(record.table.clone()).or_default().push(record);
        }
        BackupSnapshot {
            version: 1,
            created_at: Utc::now(),
            tables,
        }
    }

    fn engine(records: Vec<Record>) -> MergeDiffEngine {
        MergeDiffEngine::new(Arc::new(InMemoryStore::with_records(records)))
    }

    #[test]
    fn classification_rules() {
        let local = Record::new("t", "a", 10).with_field("x", 1);
        assert_eq!(classify(None, &local), MergeAction::Add);
        assert_eq!(
            classify(Some(&local), &Record::new("t", "a", 11).with_field("x", 1)),
            MergeAction::Update
        );
        assert_eq!(
            classify(Some(&local), &Record::new("t", "a", 9).with_field("x", 1)),
            MergeAction::Unchanged
        );
        assert_eq!(
            classify(Some(&local), &Record::new("t", "a", 10).with_field("x", 2)),
            MergeAction::Conflict
        );
        assert_eq!(
            classify(Some(&local), &Record::tombstone("t", "a", 10).with_field("x", 1)),
            MergeAction::Conflict
        );
    }

    #[test]
    fn impact_counts_per_table() {
        let engine = engine(vec![
            Record::new("tasks", "a", 1),
            Record::new("tasks", "b", 5).with_field("x", 1),
            Record::new("tasks", "c", 5).with_field("x", 1),
        ]);
        let incoming = snapshot(vec![
            Record::new("tasks", "a", 2),
            Record::new("tasks", "b", 5).with_field("x", 1),
            Record::new("tasks", "c", 4).with_field("x", 2),
            Record::new("tasks", "d", 1),
            Record::new("notes", "n", 1),
        ]);

        let impact = engine.estimate_merge_impact(&incoming).unwrap();
        assert_eq!(
            impact,
            vec![
                TableImpact {
                    table: "notes".into(),
                    adds: 1,
                    ..TableImpact::default()
                },
                TableImpact {
                    table: "tasks".into(),
                    adds: 1,
                    updates: 1,
                    unchanged: 1,
                    conflicts: 1,
                },
            ]
        );
    }

    #[test]
    fn sample_puts_changes_first() {
        let engine = engine(vec![
            Record::new("tasks", "a", 1).with_field("title", "old"),
            Record::new("tasks", "b", 1),
        ]);
        let incoming = snapshot(vec![
            Record::new("tasks", "b", 1),
            Record::new("tasks", "a", 2).with_field("title", "new"),
            Record::new("tasks", "c", 1).with_field("title", "fresh"),
        ]);

        let diffs = engine.sample_merge_diff(&incoming, 10).unwrap();
        let ids: Vec<_> = diffs.iter().map(|d| d.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(diffs[0].action, MergeAction::Update);
        assert_eq!(diffs[0].changed_fields, vec!["title"]);
        assert_eq!(diffs[0].local_updated_at, Some(1));
        assert_eq!(diffs[1].changed_fields, vec!["title"]);
        assert_eq!(diffs[1].local_updated_at, None);

        assert_eq!(engine.sample_merge_diff(&incoming, 1).unwrap().len(), 1);
    }

    #[test]
    fn resolve_applies_lww_and_resolutions() {
        let engine = engine(vec![
            Record::new("tasks", "older", 5).with_field("x", 1),
            Record::new("tasks", "tie", 5).with_field("x", 1),
        ]);
        let incoming = snapshot(vec![
            Record::new("tasks", "older", 4).with_field("x", 2),
            Record::new("tasks", "tie", 5).with_field("x", 2),
        ]);
        let plan = engine.plan(&incoming).unwrap();

        let err = plan.resolve(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, BackupError::DataConflict { ref record_id, updated_at: 5, .. } if record_id == "tie"));

        let mut resolutions = BTreeMap::new();
        resolutions.insert(("tasks".to_string(), "tie".to_string()), MergeResolution::TakeIncoming);
        let writes = plan.resolve(&resolutions).unwrap();
        let ids: Vec<_> = writes.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["tie"]);

        resolutions.insert(("tasks".to_string(), "older".to_string()), MergeResolution::TakeIncoming);
        resolutions.insert(("tasks".to_string(), "tie".to_string()), MergeResolution::KeepLocal);
        let writes = plan.resolve(&resolutions).unwrap();
        let ids: Vec<_> = writes.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["older"]);
    }

    fn arb_record() -> impl Strategy<Value = Record> {
        (0i64..5, any::<bool>(), 0u8..3).prop_map(|(rev, deleted, x)| {
            let mut record = Record::new("t", "r", rev).with_field("x", x);
            record.deleted = deleted;
            record
        })
    }

    proptest! {
        #[test]
        fn classification_matches_definition(local in arb_record(), incoming in arb_record()) {
            let action = classify(Some(&local), &incoming);
            if incoming.updated_at > local.updated_at {
                prop_assert_eq!(action, MergeAction::Update);
            } else if incoming.same_content(&local) {
                prop_assert_eq!(action, MergeAction::Unchanged);
            } else {
                prop_assert_eq!(action, MergeAction::Conflict);
            }
        }

        #[test]
        fn record_is_unchanged_against_itself(record in arb_record()) {
            prop_assert_eq!(classify(Some(&record), &record), MergeAction::Unchanged);
        }
    }
}
