//! Configuration management for the backup engine.
//!
//! Loads configuration from an optional TOML file with `SHELF__SECTION__KEY`
//! environment variable overrides.

use crate::archive::{ArchiveOptions, Compression};
use crate::identity::default_device_name;
use crate::marker::DeviceClass;
use crate::utils::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "SHELF";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub cloud: CloudConfig,
    pub archive: ArchiveConfig,
    pub store: StoreConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Human-readable name recorded in markers
    pub name: String,

    /// Device class recorded in markers (phone, tablet, desktop)
    pub class: DeviceClass,

    /// Holds the installation id file and scratch space
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Synced remote directory. Unset or missing means no container.
    pub remote_dir: Option<PathBuf>,

    /// Local copies of remote files
    pub cache_dir: PathBuf,

    /// Polling fallback when no change notification arrives
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Compression algorithm (deflate, zstd, stored)
    pub compression: Compression,

    pub compression_level: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite library database
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Six-field cron expression for automatic backups in daemon mode
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Give up waiting for an archive download after this long
    pub download_timeout_secs: Option<u64>,

    /// How long the first-launch prompt waits for the catalog to download
    pub prompt_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/shelf-backup")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            class: DeviceClass::Desktop,
            data_dir: default_data_dir(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            remote_dir: None,
            cache_dir: default_data_dir().join("cloud-cache"),
            poll_interval_ms: 2000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("library.db"),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: None,
            prompt_timeout_secs: 5,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from `path` (if given and present) layered under the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Render as TOML, e.g. to seed a config file.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.device.data_dir.join("scratch")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.cloud.poll_interval_ms.max(1))
    }

    pub fn download_timeout(&self) -> Option<Duration> {
        self.restore.download_timeout_secs.map(Duration::from_secs)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.restore.prompt_timeout_secs)
    }

    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            compression: self.archive.compression,
            level: self.archive.compression_level,
        }
    }
}
