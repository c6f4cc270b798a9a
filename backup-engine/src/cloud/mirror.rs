//! Container backed by a mounted remote directory plus a local cache.
//!
//! The remote directory is authoritative (a network mount or a folder kept in
//! sync by a third-party client). Reads and writes happen in the cache; a
//! cached file is current when it matches the remote copy in size and
//! modification time.

use super::{CloudContainer, CloudItem, DownloadStatus, ItemFilter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Remote filesystems often store coarser timestamps than the local one.
const MTIME_TOLERANCE: Duration = Duration::from_secs(2);

const CHANGE_CAPACITY: usize = 64;

pub struct MirrorContainer {
    remote_dir: PathBuf,
    cache_dir: PathBuf,
    changes: broadcast::Sender<()>,
}

impl MirrorContainer {
    pub fn new(remote_dir: PathBuf, cache_dir: PathBuf) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            remote_dir,
            cache_dir,
            changes,
        }
    }

    fn relative<'a>(&self, path: &'a Path) -> io::Result<&'a Path> {
        path.strip_prefix(&self.cache_dir).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is outside the container", path.display()),
            )
        })
    }

    fn remote_path(&self, path: &Path) -> io::Result<PathBuf> {
        Ok(self.remote_dir.join(self.relative(path)?))
    }

    fn notify(&self) {
        // No receivers is fine: nobody is watching right now
        let _ = self.changes.send(());
    }
}

impl CloudContainer for MirrorContainer {
    fn root(&self) -> Option<PathBuf> {
        if !self.remote_dir.is_dir() {
            debug!(remote = %self.remote_dir.display(), "Remote directory not available");
            return None;
        }
        if let Err(e) = fs::create_dir_all(&self.cache_dir) {
            warn!(cache = %self.cache_dir.display(), error = %e, "Cannot create cache directory");
            return None;
        }
        Some(self.cache_dir.clone())
    }

    fn gather(&self, filter: &ItemFilter) -> io::Result<Vec<CloudItem>> {
        if let ItemFilter::ExactPath(path) = filter {
            return match self.download_status(path) {
                Ok(status) => Ok(vec![CloudItem {
                    path: path.clone(),
                    status,
                }]),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }

        if !self.remote_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        for entry in WalkDir::new(&self.remote_dir).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable remote entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.remote_dir)
                .unwrap_or(entry.path());
            let local = self.cache_dir.join(relative);
            if !filter.matches(&local) {
                continue;
            }
            // One bad slot must not hide the others
            let status = match entry
                .metadata()
                .map_err(io::Error::from)
                .and_then(|remote_meta| compare(&remote_meta, &local))
            {
                Ok(status) => status,
                Err(e) => {
                    warn!(path = %local.display(), error = %e, "Skipping item with unreadable status");
                    continue;
                }
            };
            items.push(CloudItem {
                path: local,
                status,
            });
        }

        items.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(items)
    }

    fn download_status(&self, path: &Path) -> io::Result<DownloadStatus> {
        let remote = self.remote_path(path)?;
        match fs::metadata(&remote) {
            Ok(meta) => compare(&meta, path),
            Err(e) if e.kind() == io::ErrorKind::NotFound && path.is_file() => {
                // Written locally and not published yet
                Ok(DownloadStatus::Current)
            }
            Err(e) => Err(e),
        }
    }

    fn request_download(&self, path: &Path) -> io::Result<()> {
        let remote = self.remote_path(path)?;
        copy_preserving_mtime(&remote, path)?;
        debug!(path = %path.display(), "Downloaded");
        self.notify();
        Ok(())
    }

    fn upload(&self, path: &Path) -> io::Result<()> {
        let remote = self.remote_path(path)?;
        copy_preserving_mtime(path, &remote)?;
        debug!(path = %path.display(), "Uploaded");
        self.notify();
        Ok(())
    }

    fn remove_directory(&self, path: &Path) -> io::Result<()> {
        let remote = self.remote_path(path)?;
        remove_dir_if_exists(&remote)?;
        remove_dir_if_exists(path)?;
        self.notify();
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

fn compare(remote: &fs::Metadata, local: &Path) -> io::Result<DownloadStatus> {
    let local_meta = match fs::metadata(local) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DownloadStatus::NotDownloaded),
        Err(e) => return Err(e),
    };

    let remote_modified = remote.modified()?;
    let local_modified = local_meta.modified()?;
    if local_meta.len() == remote.len() && remote_modified <= local_modified + MTIME_TOLERANCE {
        Ok(DownloadStatus::Current)
    } else {
        Ok(DownloadStatus::Downloaded)
    }
}

/// Copy via a hidden sibling and rename, carrying the source mtime so both
/// sides compare equal afterwards.
fn copy_preserving_mtime(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = to
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?;
    let partial = to.with_file_name(format!(".{}.partial", file_name.to_string_lossy()));

    fs::copy(from, &partial)?;
    let modified: SystemTime = fs::metadata(from)?.modified()?;
    fs::File::options()
        .write(true)
        .open(&partial)?
        .set_modified(modified)?;
    fs::rename(&partial, to)
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
