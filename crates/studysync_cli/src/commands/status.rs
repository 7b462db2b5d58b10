//! Outbox and conflict inspection.

use super::Format;
use serde::Serialize;
use std::path::Path;
use studysync_engine::{ConflictStore, Outbox};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PendingRow {
    id: u64,
    table: String,
    record_id: String,
    op: String,
    updated_at: i64,
    attempts: u32,
    state: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConflictRow {
    id: String,
    table: String,
    record_id: String,
    kind: String,
    local_updated_at: Option<i64>,
    remote_updated_at: Option<i64>,
    reason: String,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    pending: Vec<PendingRow>,
    conflicts: Vec<ConflictRow>,
}

/// Lists pending outbox entries and unresolved conflicts.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(path)?;
    let outbox = Outbox::open(store.clone())?;
    let conflicts = ConflictStore::open(store)?;

    let report = StatusReport {
        pending: outbox
            .entries()
            .into_iter()
            .map(|c| PendingRow {
                id: c.id,
                op: c.op.as_str().to_string(),
                updated_at: c.updated_at,
                attempts: c.attempts,
                state: format!("{:?}", c.state),
                table: c.table,
                record_id: c.record_id,
            })
            .collect(),
        conflicts: conflicts
            .list()
            .into_iter()
            .map(|c| ConflictRow {
                kind: format!("{:?}", c.kind),
                local_updated_at: c.local_updated_at,
                remote_updated_at: c.remote_updated_at(),
                id: c.id,
                table: c.table_name,
                record_id: c.record_id,
                reason: c.reason,
            })
            .collect(),
    };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => {
            println!("Pending changes: {}", report.pending.len());
            for row in &report.pending {
                println!(
                    "  #{:<6} {}/{} {} @{} attempts={} {}",
                    row.id, row.table, row.record_id, row.op, row.updated_at, row.attempts, row.state
                );
            }
            println!("Conflicts: {}", report.conflicts.len());
            for row in &report.conflicts {
                println!(
                    "  {} {}/{} {} local@{} remote@{}",
                    row.id,
                    row.table,
                    row.record_id,
                    row.kind,
                    revision(row.local_updated_at),
                    revision(row.remote_updated_at)
                );
                if !row.reason.is_empty() {
                    println!("    {}", row.reason);
                }
            }
        }
    }
    Ok(())
}

fn revision(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |r| r.to_string())
}
