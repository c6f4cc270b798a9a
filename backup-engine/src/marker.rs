//! Marker records describing one backup.
//!
//! A marker lives next to its archive as `backup.info` and carries everything
//! needed to list and rank a backup without opening the archive, which may not
//! be downloaded yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the marker record inside each backup directory.
pub const MARKER_FILE_NAME: &str = "backup.info";

/// Current encoding revision written into new markers.
pub const MARKER_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("failed to read marker {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write marker {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid marker record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Coarse device category; restores are only offered between devices of the
/// same class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Phone,
    Tablet,
    Desktop,
    /// Any class written by a newer release that this build does not know.
    #[serde(other)]
    Unknown,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Phone => "phone",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
            DeviceClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one backup. Never rewritten once on disk: every backup run
/// produces a fresh record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMarkerRecord {
    /// Stable per-installation identifier of the device that made the backup
    pub device_vendor_id: String,

    /// Display name of the originating device
    pub device_name: String,

    /// When the backup was created
    pub created_at: DateTime<Utc>,

    pub device_class: DeviceClass,

    /// Data-model version the archived store was written with
    pub schema_version: String,

    /// Size of the paired archive, so listings never need to touch it
    pub archive_size_bytes: u64,

    #[serde(default = "default_format_version")]
    pub format_version: u32,
}

fn default_format_version() -> u32 {
    1
}

impl BackupMarkerRecord {
    pub fn encode(&self) -> Result<Vec<u8>, MarkerError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode a marker. Unknown fields are ignored so that records written by
    /// newer releases still list.
    pub fn decode(bytes: &[u8]) -> Result<Self, MarkerError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn read_from(path: &Path) -> Result<Self, MarkerError> {
        let bytes = fs::read(path).map_err(|source| MarkerError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::decode(&bytes)
    }

    /// Write the marker, replacing any previous one at `path` in a single
    /// rename so readers never observe a half-written record.
    pub fn write_to(&self, path: &Path) -> Result<(), MarkerError> {
        let bytes = self.encode()?;
        let write_err = |source| MarkerError::Write {
            path: path.to_path_buf(),
            source,
        };

        let tmp_path = path.with_extension("info.tmp");
        let mut file = fs::File::create(&tmp_path).map_err(write_err)?;
        file.write_all(&bytes).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        fs::rename(&tmp_path, path).map_err(write_err)
    }
}
