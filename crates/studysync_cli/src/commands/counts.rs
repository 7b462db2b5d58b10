//! Table counts command.

use super::Format;
use std::path::Path;
use studysync_backup::{BackupConfig, BackupService};

/// Prints the number of records in every user table.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let service = BackupService::new(BackupConfig::new(), super::open_store(path)?);
    let counts = service.local_table_counts()?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&counts)?),
        Format::Text => {
            if counts.is_empty() {
                println!("No app tables in {}", path.display());
            }
            for (table, count) in &counts {
                println!("{table:<24} {count:>8}");
            }
        }
    }
    Ok(())
}
