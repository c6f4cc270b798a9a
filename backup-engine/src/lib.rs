//! Backup Engine Library
//!
//! Backs up a reading-list library database to a cloud-synced directory and
//! restores it, possibly onto a different device. Each installation owns one
//! backup slot (`Backups/<installation-id>/`) holding a zip archive and a JSON
//! marker record.

pub mod archive;
pub mod backup;
pub mod catalog;
pub mod cloud;
pub mod config;
pub mod daemon;
pub mod identity;
pub mod marker;
pub mod prompt;
pub mod restore;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use backup::{BackupError, BackupOrchestrator};
pub use catalog::BackupEntry;
pub use config::Config;
pub use restore::{RestoreError, RestoreOrchestrator, RestoreOutcome, RestoreState};
pub use store::{PersistentStore, StoreError};
pub use utils::errors::EngineError;
pub use utils::Result;
