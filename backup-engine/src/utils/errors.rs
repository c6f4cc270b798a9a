//! Crate-wide error type for the backup engine.
//!
//! Backup and restore report their own richer errors ([`crate::BackupError`],
//! [`crate::RestoreError`]); this covers configuration and lifecycle misuse.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Monitor is already running; stop it before starting again")]
    MonitorAlreadyRunning,

    #[error("No backup found for installation {0}")]
    BackupNotFound(String),
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
