//! Database and per-call options
//!
//! `DbConfig` is handed to `CloudTxnDb::open` and never changes afterwards.
//! The option structs travel with individual calls.

use std::path::{Path, PathBuf};

use cumulus_core::{Error, Result};
use cumulus_storage::Snapshot;

/// Local database configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Directory holding the MANIFEST and table files
    pub dir: PathBuf,
    /// Create a fresh database when `dir` has none
    pub create_if_missing: bool,
    /// Refuse to open a database that already exists
    pub error_if_exists: bool,
}

impl DbConfig {
    /// Config for the database in `dir`, created if missing
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DbConfig {
            dir: dir.into(),
            create_if_missing: true,
            error_if_exists: false,
        }
    }

    /// Set `create_if_missing`
    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Set `error_if_exists`
    pub fn with_error_if_exists(mut self, error: bool) -> Self {
        self.error_if_exists = error;
        self
    }

    /// The database directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reject an empty directory path
    pub fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "database directory must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options for `begin_transaction`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Pin the snapshot at begin instead of at the first read
    pub set_snapshot: bool,
}

impl TransactionOptions {
    /// Options with `set_snapshot`
    pub fn with_snapshot() -> Self {
        TransactionOptions { set_snapshot: true }
    }
}

/// Options for writes and commits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Run a savepoint after the write so it is on disk before returning
    pub sync: bool,
}

impl WriteOptions {
    /// Synchronous writes
    pub fn sync() -> Self {
        WriteOptions { sync: true }
    }
}

/// Options for reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOptions {
    /// Read as of this snapshot instead of the latest committed state
    pub snapshot: Option<Snapshot>,
}

impl ReadOptions {
    /// Read as of `snapshot`
    pub fn at(snapshot: Snapshot) -> Self {
        ReadOptions {
            snapshot: Some(snapshot),
        }
    }
}
