//! Restore orchestration.
//!
//! ```text
//! Idle -> DeterminingAvailability -> [Downloading] -> Restoring -> Succeeded | Failed
//!                                          |
//!                                          +-> Cancelled | Failed (download timeout)
//! ```
//!
//! `Downloading` is skipped when the archive is already local and is the only
//! cancellable state. Once `Restoring` starts the live store is being
//! rewritten and the restore runs to completion.

pub mod procedure;

use crate::archive::ArchiveError;
use crate::catalog::BackupEntry;
use crate::cloud::{CloudContainer, CloudMonitor, ItemFilter};
use crate::store::{PersistentStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STATE_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("backup was made with unsupported schema version {0}")]
    UnsupportedVersion(String),

    #[error("backup archive is missing: {}", .0.display())]
    MissingDataArchive(PathBuf),

    #[error("could not copy the current library before restoring: {0}")]
    BackupCreationFailure(#[source] StoreError),

    #[error("could not unpack the backup archive: {0}")]
    UnpackArchiveFailure(#[source] ArchiveError),

    #[error("could not replace the library files: {0}")]
    ReplaceStoreFailure(#[source] StoreError),

    #[error("could not open the restored library: {0}")]
    InitialisationFailure(#[source] StoreError),

    #[error("restore failed ({0}) and the previous library could not be recovered")]
    ErrorRecoveryFailure(Box<RestoreError>),

    #[error("timed out waiting for the backup archive to download")]
    ArchiveDownloadTimeout,

    #[error("restore task aborted: {0}")]
    Aborted(String),
}

impl RestoreError {
    /// The live store may be left in an unknown state.
    pub fn is_urgent(&self) -> bool {
        matches!(self, RestoreError::ErrorRecoveryFailure(_) | RestoreError::Aborted(_))
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            RestoreError::UnsupportedVersion(_) => {
                "This backup was made by a newer version. Update the app and try again.".to_string()
            }
            RestoreError::MissingDataArchive(_) | RestoreError::ArchiveDownloadTimeout => {
                "The backup could not be downloaded. Check your connection and try again.".to_string()
            }
            RestoreError::ErrorRecoveryFailure(_) | RestoreError::Aborted(_) => {
                "The restore failed and your library could not be recovered. \
                 Do not make changes; reinstall and restore from a backup as soon as possible."
                    .to_string()
            }
            _ => "The restore failed and your library was left unchanged. Please try again.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    DeterminingAvailability,
    Downloading,
    Restoring,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    Cancelled,
}

enum DownloadWait {
    Ready,
    Cancelled,
}

/// Drives one restore at a time.
///
/// The caller must quiesce every other user of the store before calling
/// [`RestoreOrchestrator::restore`] and only rebuild them after it returns.
pub struct RestoreOrchestrator {
    store: Arc<dyn PersistentStore>,
    container: Arc<dyn CloudContainer>,
    scratch_root: PathBuf,
    poll_interval: Duration,
    download_timeout: Option<Duration>,
    state: watch::Sender<RestoreState>,
    transitions: broadcast::Sender<RestoreState>,
}

impl RestoreOrchestrator {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        container: Arc<dyn CloudContainer>,
        scratch_root: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(RestoreState::Idle);
        let (transitions, _) = broadcast::channel(STATE_CAPACITY);
        Self {
            store,
            container,
            scratch_root,
            poll_interval,
            download_timeout: None,
            state,
            transitions,
        }
    }

    /// Give up waiting for the archive after `timeout`.
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> RestoreState {
        *self.state.borrow()
    }

    /// Every state transition, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<RestoreState> {
        self.transitions.subscribe()
    }

    /// Restore `entry` over the live store. `cancel` is honoured only while the
    /// archive is downloading.
    pub async fn restore(
        &mut self,
        entry: &BackupEntry,
        cancel: CancellationToken,
    ) -> Result<RestoreOutcome, RestoreError> {
        info!(
            directory = %entry.directory().display(),
            device = %entry.marker().device_name,
            "Starting restore"
        );
        self.transition(RestoreState::DeterminingAvailability);

        let archive = entry.archive_path().to_path_buf();
        if !self.archive_is_current(&archive).await {
            self.transition(RestoreState::Downloading);
            match self.await_download(&archive, &cancel).await {
                Ok(DownloadWait::Ready) => {}
                Ok(DownloadWait::Cancelled) => {
                    info!("Restore cancelled while downloading");
                    self.transition(RestoreState::Cancelled);
                    return Ok(RestoreOutcome::Cancelled);
                }
                Err(e) => {
                    warn!(error = %e, "Archive download did not complete");
                    self.transition(RestoreState::Failed);
                    return Err(e);
                }
            }
        }

        self.transition(RestoreState::Restoring);
        let store = Arc::clone(&self.store);
        let entry = entry.clone();
        let scratch_root = self.scratch_root.clone();
        let result = tokio::task::spawn_blocking(move || procedure::run(store.as_ref(), &entry, &scratch_root))
            .await
            .unwrap_or_else(|e| Err(RestoreError::Aborted(e.to_string())));

        match result {
            Ok(()) => {
                info!("Restore succeeded");
                self.transition(RestoreState::Succeeded);
                Ok(RestoreOutcome::Restored)
            }
            Err(e) => {
                if e.is_urgent() {
                    error!(error = %e, "Restore failed and the store could not be recovered");
                } else {
                    warn!(error = %e, "Restore failed");
                }
                self.transition(RestoreState::Failed);
                Err(e)
            }
        }
    }

    fn transition(&self, next: RestoreState) {
        debug!(state = ?next, "Restore state");
        self.state.send_replace(next);
        let _ = self.transitions.send(next);
    }

    /// A failed query counts as not downloaded.
    async fn archive_is_current(&self, archive: &Path) -> bool {
        let container = Arc::clone(&self.container);
        let path = archive.to_path_buf();
        match tokio::task::spawn_blocking(move || container.download_status(&path)).await {
            Ok(Ok(status)) => status.is_current(),
            Ok(Err(e)) => {
                warn!(path = %archive.display(), error = %e, "Could not determine download status");
                false
            }
            Err(e) => {
                warn!(error = %e, "Download status task failed");
                false
            }
        }
    }

    /// Watch only the archive until it is current, the caller cancels, or the
    /// optional timeout passes. The watch is stopped before returning.
    async fn await_download(
        &self,
        archive: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadWait, RestoreError> {
        let mut monitor = CloudMonitor::new(
            Arc::clone(&self.container),
            ItemFilter::ExactPath(archive.to_path_buf()),
            self.poll_interval,
        );
        let mut events = monitor.subscribe();
        monitor
            .start()
            .map_err(|e| RestoreError::Aborted(e.to_string()))?;

        let deadline = self.download_timeout.map(|timeout| Instant::now() + timeout);
        let mut recheck = tokio::time::interval(self.poll_interval);

        let outcome = loop {
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(DownloadWait::Cancelled),
                _ = expired => break Err(RestoreError::ArchiveDownloadTimeout),
                event = events.recv() => {
                    debug!(event = ?event, "Archive watch notification");
                }
                _ = recheck.tick() => {}
            }

            if self.archive_is_current(archive).await {
                break Ok(DownloadWait::Ready);
            }
        };

        monitor.stop().await;
        outcome
    }
}
