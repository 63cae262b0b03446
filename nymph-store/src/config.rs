//! Driver configuration.

use serde::{Deserialize, Serialize};

/// Placeholder filename; connecting with it fails with `NotConfigured`.
pub const PLACEHOLDER_FILENAME: &str = "";

/// In-memory database filename understood by SQLite.
pub const MEMORY_FILENAME: &str = ":memory:";

/// Configuration for the SQLite driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file, or `:memory:`.
    pub filename: String,
    /// Prefix of every table name.
    pub prefix: String,
    /// How long a statement waits on a locked database (ms).
    pub busy_timeout_ms: u64,
    /// Use write-ahead logging for file databases.
    pub wal_mode: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            filename: PLACEHOLDER_FILENAME.to_string(),
            prefix: "nymph_".to_string(),
            busy_timeout_ms: 10_000,
            wal_mode: false,
        }
    }
}

impl SqliteConfig {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    /// A private in-memory database (for testing).
    pub fn in_memory() -> Self {
        Self::new(MEMORY_FILENAME)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// True while the filename is still the placeholder default.
    pub fn is_placeholder(&self) -> bool {
        self.filename == PLACEHOLDER_FILENAME
    }
}
