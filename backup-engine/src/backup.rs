//! Backup orchestration: snapshot the live store into this installation's
//! slot in the container.
//!
//! The archive is always written (and published) before the marker, so an
//! interrupted run leaves at worst an archive without a marker, which the next
//! successful run overwrites.

use crate::archive::{self, ArchiveError, ArchiveOptions, ARCHIVE_FILE_NAME};
use crate::catalog::{backups_root, BackupEntry};
use crate::cloud::CloudContainer;
use crate::identity::{is_valid_installation_id, InstallationIdentity};
use crate::marker::{BackupMarkerRecord, MarkerError, MARKER_FILE_NAME, MARKER_FORMAT_VERSION};
use crate::store::{PersistentStore, StoreError};
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("no cloud container available")]
    NoContainerUrl,

    #[error("no device identifier available, try again later")]
    NoDeviceIdentifierAvailable,

    #[error("installation id {0:?} cannot name a backup directory")]
    InvalidInstallationId(String),

    #[error("failed to create backup directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create scratch directory: {0}")]
    Scratch(#[source] io::Error),

    #[error("failed to snapshot the store: {0}")]
    Snapshot(#[source] StoreError),

    #[error("failed to pack archive: {0}")]
    Archive(#[source] ArchiveError),

    #[error("failed to write marker record: {0}")]
    MarkerWrite(#[source] MarkerError),

    #[error("failed to upload {path}: {source}")]
    Upload {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("backup task failed: {0}")]
    Aborted(String),
}

#[derive(Clone)]
pub struct BackupOrchestrator {
    store: Arc<dyn PersistentStore>,
    container: Arc<dyn CloudContainer>,
    identity: Arc<dyn InstallationIdentity>,
    archive_options: ArchiveOptions,
    scratch_root: PathBuf,
}

impl BackupOrchestrator {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        container: Arc<dyn CloudContainer>,
        identity: Arc<dyn InstallationIdentity>,
        archive_options: ArchiveOptions,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            store,
            container,
            identity,
            archive_options,
            scratch_root,
        }
    }

    /// Run [`Self::perform_backup`] on the blocking pool.
    pub async fn backup(&self) -> Result<BackupEntry, BackupError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.perform_backup())
            .await
            .map_err(|e| BackupError::Aborted(e.to_string()))?
    }

    /// Write a fresh backup of the live store into this installation's slot.
    pub fn perform_backup(&self) -> Result<BackupEntry, BackupError> {
        let root = backups_root(self.container.as_ref()).ok_or(BackupError::NoContainerUrl)?;
        let installation_id = self
            .identity
            .installation_id()
            .ok_or(BackupError::NoDeviceIdentifierAvailable)?;
        if !is_valid_installation_id(&installation_id) {
            return Err(BackupError::InvalidInstallationId(installation_id));
        }

        let directory = root.join(&installation_id);
        fs::create_dir_all(&directory).map_err(|source| BackupError::CreateDirectory {
            path: directory.clone(),
            source,
        })?;
        info!(directory = %directory.display(), "Starting backup");

        let archive_path = directory.join(ARCHIVE_FILE_NAME);
        self.write_archive(&archive_path)?;
        self.publish(&archive_path)?;

        let archive_size_bytes = match fs::metadata(&archive_path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %archive_path.display(), error = %e, "Archive size unavailable, recording 0");
                0
            }
        };

        let marker = BackupMarkerRecord {
            device_vendor_id: installation_id,
            device_name: self.identity.device_name(),
            created_at: Utc::now(),
            device_class: self.identity.device_class(),
            schema_version: self.store.current_schema_version(),
            archive_size_bytes,
            format_version: MARKER_FORMAT_VERSION,
        };
        let marker_path = directory.join(MARKER_FILE_NAME);
        marker.write_to(&marker_path).map_err(BackupError::MarkerWrite)?;
        self.publish(&marker_path)?;

        info!(
            directory = %directory.display(),
            size = archive_size_bytes,
            schema = %marker.schema_version,
            "Backup complete"
        );
        Ok(BackupEntry::new(marker, directory))
    }

    /// Snapshot into scratch space and pack it over the slot's archive.
    fn write_archive(&self, archive_path: &Path) -> Result<(), BackupError> {
        fs::create_dir_all(&self.scratch_root).map_err(BackupError::Scratch)?;
        let scratch = tempfile::Builder::new()
            .prefix("backup-snapshot-")
            .tempdir_in(&self.scratch_root)
            .map_err(BackupError::Scratch)?;

        self.store
            .snapshot_copy(scratch.path())
            .map_err(BackupError::Snapshot)?;
        archive::pack_directory(scratch.path(), archive_path, &self.archive_options)
            .map_err(BackupError::Archive)?;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!(path = %scratch_path.display(), error = %e, "Failed to remove snapshot scratch directory");
        }
        Ok(())
    }

    fn publish(&self, path: &Path) -> Result<(), BackupError> {
        self.container.upload(path).map_err(|source| BackupError::Upload {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{read_backups, BACKUPS_DIR_NAME};
    use crate::testing::{FakeContainer, FakeStore, FixedIdentity};
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        store: Arc<FakeStore>,
        container: Arc<FakeContainer>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let store = Arc::new(FakeStore::new(&tmp.path().join("live"), b"library v1"));
            let container = Arc::new(FakeContainer::new(Some(tmp.path().join("cloud"))));
            Self { tmp, store, container }
        }

        fn orchestrator(&self, identity: FixedIdentity) -> BackupOrchestrator {
            BackupOrchestrator::new(
                self.store.clone(),
                self.container.clone(),
                Arc::new(identity),
                ArchiveOptions::default(),
                self.tmp.path().join("scratch"),
            )
        }

        fn slot(&self, id: &str) -> PathBuf {
            self.tmp.path().join("cloud").join(BACKUPS_DIR_NAME).join(id)
        }
    }

    #[test]
    fn test_backup_writes_archive_and_marker() {
        let fx = Fixture::new();
        let entry = fx.orchestrator(FixedIdentity::new("DEVICE-1")).perform_backup().unwrap();

        assert_eq!(entry.directory(), fx.slot("DEVICE-1"));
        let marker = BackupMarkerRecord::read_from(&entry.marker_path()).unwrap();
        assert_eq!(&marker, entry.marker());
        assert_eq!(marker.device_vendor_id, "DEVICE-1");
        assert_eq!(marker.schema_version, "3");
        assert_eq!(marker.archive_size_bytes, fs::metadata(entry.archive_path()).unwrap().len());

        let out = fx.tmp.path().join("out");
        archive::unpack_archive(entry.archive_path(), &out).unwrap();
        assert_eq!(fs::read(out.join(crate::testing::STORE_FILE)).unwrap(), b"library v1");
    }

    #[test]
    fn test_archive_published_before_marker() {
        let fx = Fixture::new();
        let entry = fx.orchestrator(FixedIdentity::new("DEVICE-1")).perform_backup().unwrap();
        assert_eq!(
            fx.container.uploads(),
            vec![entry.archive_path().to_path_buf(), entry.marker_path()]
        );
    }

    #[test]
    fn test_repeated_backups_overwrite_single_slot() {
        let fx = Fixture::new();
        let orchestrator = fx.orchestrator(FixedIdentity::new("DEVICE-1"));
        let first = orchestrator.perform_backup().unwrap();
        let second = orchestrator.perform_backup().unwrap();
        assert!(second.marker().created_at >= first.marker().created_at);

        let mut names: Vec<_> = fs::read_dir(fx.slot("DEVICE-1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![ARCHIVE_FILE_NAME, MARKER_FILE_NAME]);
        assert_eq!(read_backups(fx.container.as_ref(), Some("DEVICE-1")).len(), 1);
        // Scratch snapshots are cleaned up
        assert_eq!(fs::read_dir(fx.tmp.path().join("scratch")).unwrap().count(), 0);
    }

    #[test]
    fn test_backup_without_container() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = BackupOrchestrator::new(
            Arc::new(FakeStore::new(&tmp.path().join("live"), b"x")),
            Arc::new(FakeContainer::new(None)),
            Arc::new(FixedIdentity::new("DEVICE-1")),
            ArchiveOptions::default(),
            tmp.path().join("scratch"),
        );
        assert!(matches!(orchestrator.perform_backup(), Err(BackupError::NoContainerUrl)));
    }

    #[test]
    fn test_backup_without_identity() {
        let fx = Fixture::new();
        let identity = FixedIdentity { id: None, ..FixedIdentity::new("unused") };
        assert!(matches!(
            fx.orchestrator(identity).perform_backup(),
            Err(BackupError::NoDeviceIdentifierAvailable)
        ));
        assert!(!fx.tmp.path().join("cloud").join(BACKUPS_DIR_NAME).exists());
    }

    #[test]
    fn test_backup_rejects_path_like_identity() {
        let fx = Fixture::new();
        let result = fx.orchestrator(FixedIdentity::new("../escaped")).perform_backup();
        assert!(matches!(result, Err(BackupError::InvalidInstallationId(id)) if id == "../escaped"));
        assert!(!fx.tmp.path().join("cloud/escaped").exists());
        assert!(fx.store.calls().is_empty());
    }

    #[test]
    fn test_snapshot_failure_writes_no_marker() {
        let fx = Fixture::new();
        fx.store.fail_snapshot();
        let result = fx.orchestrator(FixedIdentity::new("DEVICE-1")).perform_backup();
        assert!(matches!(result, Err(BackupError::Snapshot(_))));
        assert!(!fx.slot("DEVICE-1").join(MARKER_FILE_NAME).exists());
        assert!(fx.container.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_async_backup() {
        let fx = Fixture::new();
        let entry = fx.orchestrator(FixedIdentity::new("DEVICE-2")).backup().await.unwrap();
        assert!(entry.archive_path().exists());
    }
}
