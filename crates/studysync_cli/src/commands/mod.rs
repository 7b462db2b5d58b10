//! CLI command implementations.

pub mod backup;
pub mod counts;
pub mod status;

use std::path::Path;
use std::sync::Arc;
use studysync_store::{FileStore, LocalStore};
use thiserror::Error;

/// Errors raised by argument handling.
#[derive(Debug, Error)]
pub enum CliError {
    /// An argument could not be interpreted.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Output format of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens the store directory at `path`.
pub fn open_store(path: &Path) -> Result<Arc<dyn LocalStore>, Box<dyn std::error::Error>> {
    let store = FileStore::open(path)?;
    Ok(Arc::new(store))
}

/// Splits a `table/id` reference.
pub fn parse_record_ref(value: &str) -> Result<(String, String), CliError> {
    match value.split_once('/') {
        Some((table, id)) if !table.is_empty() && !id.is_empty() => {
            Ok((table.to_string(), id.to_string()))
        }
        _ => Err(CliError::InvalidArgument(format!(
            "expected table/id, got {value:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_refs() {
        assert_eq!(
            parse_record_ref("tasks/t1").unwrap(),
            ("tasks".to_string(), "t1".to_string())
        );
        assert_eq!(
            parse_record_ref("tasks/a/b").unwrap(),
            ("tasks".to_string(), "a/b".to_string())
        );
        assert!(parse_record_ref("tasks").is_err());
        assert!(parse_record_ref("/t1").is_err());
    }
}
