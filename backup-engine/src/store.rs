//! Contract with the live persistent store.
//!
//! The engine never opens the library database itself. It drives an
//! implementation of [`PersistentStore`] that knows the on-disk file set and
//! the schema migrations.
//!
//! Restore requires exclusive access: the caller must tear down every other
//! handle to the store before a restore starts and only rebuild them once the
//! restore has reported its outcome. A backup only needs a coherent snapshot
//! read and may run while the store is in use.

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("unknown schema version: {0}")]
    UnknownSchemaVersion(String),
}

pub trait PersistentStore: Send + Sync {
    /// Schema version this build writes.
    fn current_schema_version(&self) -> String;

    /// Whether files written with `version` can be opened, possibly after a
    /// migration.
    fn recognizes_schema_version(&self, version: &str) -> bool;

    /// Write a coherent copy of every store file into `destination`, which
    /// already exists and is empty.
    fn snapshot_copy(&self, destination: &Path) -> Result<(), StoreError>;

    /// Close the live store and replace its files with the ones found in
    /// `source`.
    fn replace_files(&self, source: &Path) -> Result<(), StoreError>;

    /// Reopen the store from whatever files are in place, migrating from
    /// `files_schema_version` to the current version when they differ.
    fn reinitialize(&self, files_schema_version: &str) -> Result<(), StoreError>;
}
