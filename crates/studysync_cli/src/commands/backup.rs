//! Backup, restore and rotation commands.

use super::{parse_record_ref, Format};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use studysync_backup::{
    BackupConfig, BackupOptions, BackupService, FixedPicker, FsBackupDirectory, ImportMode,
    ImportOptions, MergeResolution,
};
use studysync_store::InMemoryStore;
use tracing::info;

fn options(password: Option<&str>) -> BackupOptions {
    match password {
        Some(password) => BackupOptions::new().with_password(password),
        None => BackupOptions::new(),
    }
}

/// A service for commands that only read backup files.
fn detached(config: BackupConfig) -> BackupService {
    BackupService::new(config, Arc::new(InMemoryStore::new()))
}

/// Writes a backup of the store to `output`.
pub fn export(
    db_path: &Path,
    output: &Path,
    password: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Exporting {:?}", db_path);
    let service = BackupService::new(BackupConfig::new(), super::open_store(db_path)?);
    let download = service.export_backup_download(&options(password))?;

    let mut file = fs::File::create(output)?;
    file.write_all(&download.bytes)?;
    file.sync_all()?;

    println!("✓ Backup exported");
    println!("  Path: {:?}", output);
    println!("  Size: {} bytes", download.bytes.len());
    println!("  Encrypted: {}", password.is_some());
    Ok(())
}

/// Saves a backup into `dir` and rotates old snapshots.
pub fn save(
    db_path: &Path,
    dir: &Path,
    password: Option<&str>,
    retention: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = BackupConfig::new().with_retention(retention);
    let service = BackupService::new(config, super::open_store(db_path)?);
    let directory = Arc::new(FsBackupDirectory::create(dir)?);
    service.choose_backup_directory(&FixedPicker::new(directory))?;

    let saved = service.save_backup_to_directory(&options(password))?;
    println!("✓ Saved {}", saved.file_name);
    for name in &saved.rotated {
        println!("  rotated out {name}");
    }
    Ok(())
}

/// Removes snapshots in `dir` beyond `retention`.
pub fn rotate(dir: &Path, retention: usize) -> Result<(), Box<dyn std::error::Error>> {
    let service = detached(BackupConfig::new().with_retention(retention));
    service.set_backup_directory(Arc::new(FsBackupDirectory::new(dir)))?;

    let removed = service.rotate_backups_now()?;
    if removed.is_empty() {
        println!("Nothing to rotate");
    }
    for name in &removed {
        println!("removed {name}");
    }
    Ok(())
}

/// Checks that a backup file can be read and prints its contents summary.
pub fn validate(
    file: &Path,
    password: Option<&str>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = fs::read(file)?;
    let preview = detached(BackupConfig::new()).validate_backup_file(&bytes, password)?;

    match format {
        Format::Json => {
            let json = serde_json::json!({
                "version": preview.version,
                "createdAt": preview.created_at,
                "encrypted": preview.encrypted,
                "incomingCounts": preview.incoming_counts,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        Format::Text => {
            println!("✓ Backup is valid");
            println!("  Version: {}", preview.version);
            println!("  Created: {}", preview.created_at);
            println!("  Encrypted: {}", preview.encrypted);
            for (table, count) in &preview.incoming_counts {
                println!("  {table:<24} {count:>8}");
            }
        }
    }
    Ok(())
}

/// Restores a backup file into the store.
pub fn import(
    db_path: &Path,
    file: &Path,
    replace: bool,
    password: Option<&str>,
    take_incoming: &[String],
    keep_local: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = fs::read(file)?;
    let mut import = if replace {
        ImportOptions::replace()
    } else {
        ImportOptions::merge()
    };
    if let Some(password) = password {
        import = import.with_password(password);
    }
    for (refs, resolution) in [
        (take_incoming, MergeResolution::TakeIncoming),
        (keep_local, MergeResolution::KeepLocal),
    ] {
        for value in refs {
            let (table, id) = parse_record_ref(value)?;
            import = import.resolve(table, id, resolution);
        }
    }

    let service = BackupService::new(BackupConfig::new(), super::open_store(db_path)?);
    let report = service.import_backup_from_file(&bytes, &import)?;

    println!("✓ Backup imported");
    println!(
        "  Mode: {}",
        if report.mode == ImportMode::Replace { "replace" } else { "merge" }
    );
    println!("  Written: {}", report.written);
    if report.mode == ImportMode::Replace {
        println!("  Removed: {}", report.removed);
    }
    Ok(())
}

/// Prints what a merge import would change per table.
pub fn estimate(
    db_path: &Path,
    file: &Path,
    password: Option<&str>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = fs::read(file)?;
    let service = BackupService::new(BackupConfig::new(), super::open_store(db_path)?);
    let impact = service.estimate_merge_impact(&bytes, password)?;

    match format {
        Format::Json => {
            let rows: Vec<_> = impact
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "table": t.table,
                        "adds": t.adds,
                        "updates": t.updates,
                        "unchanged": t.unchanged,
                        "conflicts": t.conflicts,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Format::Text => {
            println!(
                "{:<24} {:>8} {:>8} {:>10} {:>10}",
                "table", "adds", "updates", "unchanged", "conflicts"
            );
            for t in &impact {
                println!(
                    "{:<24} {:>8} {:>8} {:>10} {:>10}",
                    t.table, t.adds, t.updates, t.unchanged, t.conflicts
                );
            }
        }
    }
    Ok(())
}

/// Prints up to `limit` record diffs of a merge import.
pub fn sample(
    db_path: &Path,
    file: &Path,
    limit: usize,
    password: Option<&str>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = fs::read(file)?;
    let service = BackupService::new(BackupConfig::new(), super::open_store(db_path)?);
    let diffs = service.sample_merge_diff(&bytes, limit, password)?;

    match format {
        Format::Json => {
            let rows: Vec<_> = diffs
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "table": d.table,
                        "recordId": d.record_id,
                        "action": d.action.as_str(),
                        "localUpdatedAt": d.local_updated_at,
                        "incomingUpdatedAt": d.incoming_updated_at,
                        "changedFields": d.changed_fields,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Format::Text => {
            for d in &diffs {
                println!(
                    "{:<10} {}/{} incoming@{} fields=[{}]",
                    d.action.as_str(),
                    d.table,
                    d.record_id,
                    d.incoming_updated_at,
                    d.changed_fields.join(", ")
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use studysync_store::{FileStore, LocalStore, Record};
    use tempfile::tempdir;

    #[test]
    fn export_then_replace_import_between_stores() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        let file = dir.path().join("backup.json");
        {
            let store = FileStore::open(&source).unwrap();
            store.put(Record::new("tasks", "t1", 3).with_field("title", "Read")).unwrap();
        }

        export(&source, &file, Some("pw")).unwrap();
        validate(&file, Some("pw"), Format::Json).unwrap();
        import(&target, &file, true, Some("pw"), &[], &[]).unwrap();

        let store = FileStore::open(&target).unwrap();
        assert_eq!(store.get("tasks", "t1").unwrap().unwrap().updated_at, 3);
    }

    #[test]
    fn save_rotates_to_retention() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("db");
        let backups = dir.path().join("backups");
        {
            let store = FileStore::open(&db).unwrap();
            store.put(Record::new("tasks", "t1", 1)).unwrap();
        }

        for _ in 0..3 {
            save(&db, &backups, None, 2).unwrap();
        }
        assert_eq!(fs::read_dir(&backups).unwrap().count(), 2);

        rotate(&backups, 1).unwrap();
        assert_eq!(fs::read_dir(&backups).unwrap().count(), 1);
    }

    #[test]
    fn bad_resolution_ref_is_rejected() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("db");
        let file = dir.path().join("backup.json");
        FileStore::open(&db).unwrap();
        export(&db, &file, None).unwrap();
        assert!(import(&db, &file, false, None, &["nope".to_string()], &[]).is_err());
    }
}
