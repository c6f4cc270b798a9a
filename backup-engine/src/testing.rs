//! In-memory collaborators for unit tests.

use crate::archive::{pack_directory, ArchiveOptions, ARCHIVE_FILE_NAME};
use crate::catalog::{BackupEntry, BACKUPS_DIR_NAME};
use crate::cloud::{CloudContainer, CloudItem, DownloadStatus, ItemFilter};
use crate::identity::InstallationIdentity;
use crate::marker::{BackupMarkerRecord, DeviceClass, MARKER_FILE_NAME, MARKER_FORMAT_VERSION};
use crate::store::{PersistentStore, StoreError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use walkdir::WalkDir;

/// Container over a plain directory. Files on disk are current unless a
/// status override says otherwise; overrides without a file on disk model
/// remote-only files.
pub(crate) struct FakeContainer {
    root: Option<PathBuf>,
    overrides: Mutex<BTreeMap<PathBuf, DownloadStatus>>,
    hydrate_on_request: AtomicBool,
    fail_downloads: AtomicBool,
    requests: Mutex<Vec<PathBuf>>,
    uploads: Mutex<Vec<PathBuf>>,
    changes: broadcast::Sender<()>,
}

impl FakeContainer {
    pub(crate) fn new(root: Option<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            root,
            overrides: Mutex::new(BTreeMap::new()),
            hydrate_on_request: AtomicBool::new(false),
            fail_downloads: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            changes,
        }
    }

    pub(crate) fn set_status(&self, path: &Path, status: DownloadStatus) {
        self.overrides.lock().unwrap().insert(path.to_path_buf(), status);
        let _ = self.changes.send(());
    }

    pub(crate) fn forget(&self, path: &Path) {
        self.overrides.lock().unwrap().remove(path);
        let _ = self.changes.send(());
    }

    pub(crate) fn set_hydrate_on_request(&self, hydrate: bool) {
        self.hydrate_on_request.store(hydrate, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn download_requests(&self) -> Vec<PathBuf> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().unwrap().clone()
    }
}

impl CloudContainer for FakeContainer {
    fn root(&self) -> Option<PathBuf> {
        self.root.clone()
    }

    fn gather(&self, filter: &ItemFilter) -> io::Result<Vec<CloudItem>> {
        let overrides = self.overrides.lock().unwrap().clone();
        let mut found: BTreeMap<PathBuf, DownloadStatus> = BTreeMap::new();

        if let Some(root) = self.root.as_ref().filter(|r| r.is_dir()) {
            for entry in WalkDir::new(root) {
                let entry = entry?;
                if entry.file_type().is_file() && filter.matches(entry.path()) {
                    let status = overrides
                        .get(entry.path())
                        .copied()
                        .unwrap_or(DownloadStatus::Current);
                    found.insert(entry.path().to_path_buf(), status);
                }
            }
        }
        for (path, status) in overrides {
            if filter.matches(&path) {
                found.entry(path).or_insert(status);
            }
        }

        Ok(found
            .into_iter()
            .map(|(path, status)| CloudItem { path, status })
            .collect())
    }

    fn download_status(&self, path: &Path) -> io::Result<DownloadStatus> {
        if let Some(status) = self.overrides.lock().unwrap().get(path) {
            return Ok(*status);
        }
        if path.is_file() {
            Ok(DownloadStatus::Current)
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such item"))
        }
    }

    fn request_download(&self, path: &Path) -> io::Result<()> {
        self.requests.lock().unwrap().push(path.to_path_buf());
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "offline"));
        }
        if self.hydrate_on_request.load(Ordering::SeqCst) {
            self.set_status(path, DownloadStatus::Current);
        }
        Ok(())
    }

    fn upload(&self, path: &Path) -> io::Result<()> {
        self.uploads.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn remove_directory(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)?;
        self.overrides.lock().unwrap().retain(|p, _| !p.starts_with(path));
        let _ = self.changes.send(());
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

pub(crate) const STORE_FILE: &str = "library.db";

/// Store kept as plain files in a directory, with countdown failure
/// injection per operation.
pub(crate) struct FakeStore {
    dir: PathBuf,
    current_version: String,
    known_versions: Vec<String>,
    fail_snapshot: AtomicBool,
    replace_failures: AtomicUsize,
    reinit_failures: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl FakeStore {
    pub(crate) fn new(dir: &Path, contents: &[u8]) -> Self {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(STORE_FILE), contents).unwrap();
        Self {
            dir: dir.to_path_buf(),
            current_version: "3".into(),
            known_versions: vec!["1".into(), "2".into(), "3".into()],
            fail_snapshot: AtomicBool::new(false),
            replace_failures: AtomicUsize::new(0),
            reinit_failures: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn contents(&self) -> Vec<u8> {
        fs::read(self.dir.join(STORE_FILE)).unwrap()
    }

    pub(crate) fn fail_snapshot(&self) {
        self.fail_snapshot.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_replaces(&self, count: usize) {
        self.replace_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_reinits(&self, count: usize) {
        self.reinit_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn copy_files(from: &Path, to: &Path) -> io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }
    Ok(())
}

impl PersistentStore for FakeStore {
    fn current_schema_version(&self) -> String {
        self.current_version.clone()
    }

    fn recognizes_schema_version(&self, version: &str) -> bool {
        self.known_versions.iter().any(|v| v == version)
    }

    fn snapshot_copy(&self, destination: &Path) -> Result<(), StoreError> {
        self.record("snapshot".into());
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(StoreError::Database("snapshot failed".into()));
        }
        copy_files(&self.dir, destination)?;
        Ok(())
    }

    fn replace_files(&self, source: &Path) -> Result<(), StoreError> {
        self.record("replace".into());
        if Self::take_failure(&self.replace_failures) {
            return Err(StoreError::Database("replace failed".into()));
        }
        fs::remove_file(self.dir.join(STORE_FILE))?;
        copy_files(source, &self.dir)?;
        Ok(())
    }

    fn reinitialize(&self, files_schema_version: &str) -> Result<(), StoreError> {
        self.record(format!("reinitialize:{}", files_schema_version));
        if Self::take_failure(&self.reinit_failures) {
            return Err(StoreError::Database("open failed".into()));
        }
        Ok(())
    }
}

pub(crate) struct FixedIdentity {
    pub(crate) id: Option<String>,
    pub(crate) class: DeviceClass,
}

impl FixedIdentity {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            class: DeviceClass::Phone,
        }
    }
}

impl InstallationIdentity for FixedIdentity {
    fn installation_id(&self) -> Option<String> {
        self.id.clone()
    }

    fn device_name(&self) -> String {
        "Test Phone".to_string()
    }

    fn device_class(&self) -> DeviceClass {
        self.class
    }
}

/// Write a packed backup of `contents` with its marker into
/// `root/Backups/<id>` and return the entry describing it.
pub(crate) fn staged_backup(root: &Path, id: &str, schema_version: &str, contents: &[u8]) -> BackupEntry {
    let staged = root.join(format!(".staging-{}", id));
    fs::create_dir_all(&staged).unwrap();
    fs::write(staged.join(STORE_FILE), contents).unwrap();

    let slot = root.join(BACKUPS_DIR_NAME).join(id);
    fs::create_dir_all(&slot).unwrap();
    let size = pack_directory(&staged, &slot.join(ARCHIVE_FILE_NAME), &ArchiveOptions::default()).unwrap();
    fs::remove_dir_all(&staged).unwrap();

    let marker = BackupMarkerRecord {
        device_vendor_id: id.to_string(),
        device_name: format!("device {}", id),
        created_at: Utc::now(),
        device_class: DeviceClass::Phone,
        schema_version: schema_version.to_string(),
        archive_size_bytes: size,
        format_version: MARKER_FORMAT_VERSION,
    };
    marker.write_to(&slot.join(MARKER_FILE_NAME)).unwrap();
    BackupEntry::new(marker, slot)
}
