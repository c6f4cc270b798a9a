//! Remote-synced storage.
//!
//! Backups live in a directory tree that is shared between a user's devices.
//! Files can be present remotely long before they are available locally, so
//! every item carries a download status and can be asked to download.

pub mod mirror;
pub mod monitor;

pub use mirror::MirrorContainer;
pub use monitor::{CloudMonitor, MonitorEvent};

use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Local availability of a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Only the remote copy exists
    NotDownloaded,
    /// A local copy exists but the remote one is newer
    Downloaded,
    /// The local copy is the latest version
    Current,
}

impl DownloadStatus {
    pub fn is_current(&self) -> bool {
        matches!(self, DownloadStatus::Current)
    }
}

/// One file in a gathered result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudItem {
    /// Local path the file is (or will be) readable at
    pub path: PathBuf,
    pub status: DownloadStatus,
}

/// Which files a watch is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemFilter {
    /// Every file with this exact name, anywhere under the root
    FileName(String),
    /// A single file
    ExactPath(PathBuf),
}

impl ItemFilter {
    pub fn matches(&self, path: &Path) -> bool {
        match self {
            ItemFilter::FileName(name) => path
                .file_name()
                .map(|n| n == name.as_str())
                .unwrap_or(false),
            ItemFilter::ExactPath(target) => path == target,
        }
    }
}

/// Remote-file watch primitive.
///
/// Paths handed in and out are local paths below [`CloudContainer::root`].
pub trait CloudContainer: Send + Sync {
    /// Local root of the container, or `None` when no remote storage is
    /// configured or reachable.
    fn root(&self) -> Option<PathBuf>;

    /// Current result set for `filter`.
    fn gather(&self, filter: &ItemFilter) -> io::Result<Vec<CloudItem>>;

    fn download_status(&self, path: &Path) -> io::Result<DownloadStatus>;

    /// Make the latest remote version of `path` available locally. May block
    /// for the duration of the transfer.
    fn request_download(&self, path: &Path) -> io::Result<()>;

    /// Publish a file written locally to the remote side.
    fn upload(&self, path: &Path) -> io::Result<()>;

    /// Remove a directory both locally and remotely.
    fn remove_directory(&self, path: &Path) -> io::Result<()>;

    /// Fires whenever the container's contents change.
    fn changes(&self) -> broadcast::Receiver<()>;
}
