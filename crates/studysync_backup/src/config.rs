//! Configuration for backups.

/// Configuration for backup operations.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Snapshot files kept in the backup directory.
    pub retention: usize,
    /// PBKDF2 iterations for newly written encrypted backups.
    pub kdf_iterations: u32,
    /// File name prefix of snapshots this service writes.
    pub file_prefix: String,
}

impl BackupConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            retention: 10,
            kdf_iterations: 210_000,
            file_prefix: "studysync-backup".into(),
        }
    }

    /// Sets the retention count (at least one).
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Sets the PBKDF2 iteration count.
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations.max(1);
        self
    }

    /// Sets the file name prefix.
    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_to_sane_values() {
        let config = BackupConfig::new()
            .with_retention(0)
            .with_kdf_iterations(0)
            .with_file_prefix("nightly");
        assert_eq!(config.retention, 1);
        assert_eq!(config.kdf_iterations, 1);
        assert_eq!(config.file_prefix, "nightly");
    }
}
