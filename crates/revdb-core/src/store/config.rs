//! Database configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a database and its underlying engine.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Open existing data only; creation and writes are refused.
    pub read_only: bool,

    /// Engine page cache capacity in bytes.
    pub cache_capacity: u64,

    /// Number of staged records in one commit that forces an immediate
    /// disk flush even when `flush_before_commit` is off.
    pub wal_threshold: u64,

    /// Flush the engine log to disk as part of every commit.
    pub flush_before_commit: bool,

    /// Maintain the by-sequence index trees. Disabling saves space but
    /// makes sequence enumeration unavailable.
    pub sequence_index: bool,

    /// Enable engine-level value compression.
    pub compression: bool,

    /// How often commits probe whether the overflow-body sweep should run.
    pub compactor_interval: Duration,

    /// Temporary database (deleted on drop).
    pub temporary: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./revdb_data"),
            read_only: false,
            cache_capacity: 8 * 1024 * 1024,
            wal_threshold: 1024,
            flush_before_commit: true,
            sequence_index: true,
            compression: true,
            compactor_interval: Duration::from_secs(300),
            temporary: false,
        }
    }
}

impl DatabaseConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a temporary in-memory configuration for testing.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            ..Default::default()
        }
    }

    /// Set the read-only flag.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the compaction probe interval.
    pub fn with_compactor_interval(mut self, interval: Duration) -> Self {
        self.compactor_interval = interval;
        self
    }

    /// Disable the by-sequence index.
    pub fn without_sequence_index(mut self) -> Self {
        self.sequence_index = false;
        self
    }

    /// Convert to sled configuration.
    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let mut config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression);

        if self.temporary {
            config = config.temporary(true);
        } else {
            config = config.path(&self.path);
        }

        // With flush-before-commit every commit flushes explicitly, so the
        // background flusher is unnecessary.
        if self.flush_before_commit {
            config = config.flush_every_ms(None);
        } else {
            config = config.flush_every_ms(Some(1000));
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_contract() {
        let config = DatabaseConfig::default();
        assert_eq!(config.cache_capacity, 8 * 1024 * 1024);
        assert_eq!(config.wal_threshold, 1024);
        assert!(config.flush_before_commit);
        assert!(config.sequence_index);
        assert!(config.compression);
        assert_eq!(config.compactor_interval, Duration::from_secs(300));
        assert!(!config.read_only);
    }

    #[test]
    fn test_builder_setters() {
        let config = DatabaseConfig::new("/tmp/x")
            .read_only(true)
            .without_sequence_index();
        assert!(config.read_only);
        assert!(!config.sequence_index);
        assert_eq!(config.path, PathBuf::from("/tmp/x"));
    }
}
