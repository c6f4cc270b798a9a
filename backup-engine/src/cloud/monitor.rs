//! Watches a container for files of interest and reports when they become
//! available locally.
//!
//! Each monitor owns one task. Every notification (container change, poll
//! tick, finished download) is handled on that task from a single gathered
//! snapshot, so the per-file state needs no locking.

use super::{CloudContainer, CloudItem, ItemFilter};
use crate::utils::{EngineError, Result};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Events emitted from the monitor's task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Every file of the first gathered result set is now local. Emitted at
    /// most once per monitor.
    InitialDownloadComplete,
    /// A file that was seen as not downloaded is now current.
    FileDownloaded(PathBuf),
}

struct RunningWatch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CloudMonitor {
    container: Arc<dyn CloudContainer>,
    filter: ItemFilter,
    poll_interval: Duration,
    events: broadcast::Sender<MonitorEvent>,
    initial_complete: watch::Sender<bool>,
    running: Option<RunningWatch>,
}

impl CloudMonitor {
    pub fn new(container: Arc<dyn CloudContainer>, filter: ItemFilter, poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (initial_complete, _) = watch::channel(false);
        Self {
            container,
            filter,
            poll_interval,
            events,
            initial_complete,
            running: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Latch view of [`MonitorEvent::InitialDownloadComplete`] for callers that
    /// may subscribe after it fired.
    pub fn initial_download_complete(&self) -> watch::Receiver<bool> {
        self.initial_complete.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Begin watching. Download requests go out for every matching file that is
    /// not local yet as part of the first gather.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(EngineError::MonitorAlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let task = WatchTask {
            container: Arc::clone(&self.container),
            filter: self.filter.clone(),
            events: self.events.clone(),
            initial_complete: self.initial_complete.clone(),
            downloaded: HashMap::new(),
            initial_pending: None,
            in_flight: HashSet::new(),
            done_tx,
        };

        info!(filter = ?self.filter, "Starting cloud monitor");
        let handle = tokio::spawn(task.run(cancel.clone(), done_rx, self.poll_interval));
        self.running = Some(RunningWatch { cancel, handle });
        Ok(())
    }

    /// Stop watching. Once this returns no further events are emitted. Safe to
    /// call when not started.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            if !e.is_cancelled() {
                error!(error = %e, "Cloud monitor task failed");
            }
        }
        debug!(filter = ?self.filter, "Cloud monitor stopped");
    }
}

impl Drop for CloudMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.handle.abort();
        }
    }
}

struct WatchTask {
    container: Arc<dyn CloudContainer>,
    filter: ItemFilter,
    events: broadcast::Sender<MonitorEvent>,
    initial_complete: watch::Sender<bool>,
    /// Last observed "fully downloaded" state per path
    downloaded: HashMap<PathBuf, bool>,
    /// Members of the first result set still waiting to download; `None`
    /// until the first gather succeeds
    initial_pending: Option<HashSet<PathBuf>>,
    in_flight: HashSet<PathBuf>,
    done_tx: mpsc::UnboundedSender<(PathBuf, io::Result<()>)>,
}

impl WatchTask {
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut done_rx: mpsc::UnboundedReceiver<(PathBuf, io::Result<()>)>,
        poll_interval: Duration,
    ) {
        let mut changes = self.container.changes();
        let mut changes_open = true;
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some((path, result)) = done_rx.recv() => {
                    self.in_flight.remove(&path);
                    if let Err(e) = result {
                        warn!(path = %path.display(), error = %e, "Download request failed, retrying on next change");
                    }
                    // A finished download shows up through the change feed or
                    // the next poll; gathering here would re-request at once
                    continue;
                }
                change = changes.recv(), if changes_open => {
                    if let Err(RecvError::Closed) = change {
                        debug!("Container change feed closed, polling only");
                        changes_open = false;
                        continue;
                    }
                }
                // First tick completes immediately and drives the initial gather
                _ = ticker.tick() => {}
            }

            if cancel.is_cancelled() {
                break;
            }
            self.process_snapshot().await;
        }
    }

    async fn process_snapshot(&mut self) {
        let container = Arc::clone(&self.container);
        let filter = self.filter.clone();
        let items = match tokio::task::spawn_blocking(move || container.gather(&filter)).await {
            Ok(Ok(items)) => items,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to gather container contents");
                return;
            }
            Err(e) => {
                error!(error = %e, "Gather task failed");
                return;
            }
        };

        self.apply_snapshot(&items);
        self.request_missing(&items);
    }

    fn apply_snapshot(&mut self, items: &[CloudItem]) {
        let mut next = HashMap::with_capacity(items.len());
        for item in items {
            let current = item.status.is_current();
            if current && self.downloaded.get(&item.path) == Some(&false) {
                debug!(path = %item.path.display(), "File downloaded");
                let _ = self.events.send(MonitorEvent::FileDownloaded(item.path.clone()));
            }
            next.insert(item.path.clone(), current);
        }
        // Paths missing from this snapshot are dropped here
        self.downloaded = next;

        if *self.initial_complete.borrow() {
            return;
        }
        let pending = self.initial_pending.get_or_insert_with(|| {
            items
                .iter()
                .filter(|item| !item.status.is_current())
                .map(|item| item.path.clone())
                .collect()
        });
        pending.retain(|path| self.downloaded.get(path) == Some(&false));

        if pending.is_empty() {
            info!(filter = ?self.filter, "All initially gathered files are downloaded");
            self.initial_complete.send_replace(true);
            let _ = self.events.send(MonitorEvent::InitialDownloadComplete);
        }
    }

    fn request_missing(&mut self, items: &[CloudItem]) {
        for item in items.iter().filter(|item| !item.status.is_current()) {
            if !self.in_flight.insert(item.path.clone()) {
                continue;
            }
            debug!(path = %item.path.display(), "Requesting download");
            let container = Arc::clone(&self.container);
            let done_tx = self.done_tx.clone();
            let path = item.path.clone();
            tokio::task::spawn_blocking(move || {
                let result = container.request_download(&path);
                let _ = done_tx.send((path, result));
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::DownloadStatus;
    use crate::testing::FakeContainer;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn marker_filter() -> ItemFilter {
        ItemFilter::FileName("backup.info".into())
    }

    async fn next_event(rx: &mut broadcast::Receiver<MonitorEvent>) -> MonitorEvent {
        timeout(WAIT, rx.recv()).await.expect("timed out").expect("closed")
    }

    #[tokio::test]
    async fn test_empty_result_set_fires_initial_event_once() {
        let tmp = TempDir::new().unwrap();
        let container = Arc::new(FakeContainer::new(Some(tmp.path().to_path_buf())));
        let mut monitor = CloudMonitor::new(container.clone(), marker_filter(), Duration::from_millis(20));
        let mut events = monitor.subscribe();

        monitor.start().unwrap();
        assert_eq!(next_event(&mut events).await, MonitorEvent::InitialDownloadComplete);

        // Later arrivals must not fire the one-shot event again
        let path = tmp.path().join("Backups/A/backup.info");
        container.set_status(&path, DownloadStatus::NotDownloaded);
        container.set_status(&path, DownloadStatus::Current);
        tokio::time::sleep(Duration::from_millis(200)).await;
        monitor.stop().await;

        while let Ok(event) = events.try_recv() {
            assert_ne!(event, MonitorEvent::InitialDownloadComplete);
        }
        assert!(*monitor.initial_download_complete().borrow());
    }

    #[tokio::test]
    async fn test_requests_downloads_and_reports_transitions() {
        let tmp = TempDir::new().unwrap();
        let container = Arc::new(FakeContainer::new(Some(tmp.path().to_path_buf())));
        container.set_hydrate_on_request(true);
        let a = tmp.path().join("Backups/A/backup.info");
        let b = tmp.path().join("Backups/B/backup.info");
        container.set_status(&a, DownloadStatus::NotDownloaded);
        container.set_status(&b, DownloadStatus::Current);

        let mut monitor = CloudMonitor::new(container.clone(), marker_filter(), Duration::from_millis(20));
        let mut events = monitor.subscribe();
        monitor.start().unwrap();

        assert_eq!(next_event(&mut events).await, MonitorEvent::FileDownloaded(a.clone()));
        assert_eq!(next_event(&mut events).await, MonitorEvent::InitialDownloadComplete);
        monitor.stop().await;

        assert_eq!(container.download_requests(), vec![a]);
    }

    #[tokio::test]
    async fn test_initial_event_waits_for_first_result_set() {
        let tmp = TempDir::new().unwrap();
        let container = Arc::new(FakeContainer::new(Some(tmp.path().to_path_buf())));
        let a = tmp.path().join("Backups/A/backup.info");
        container.set_status(&a, DownloadStatus::NotDownloaded);

        let mut monitor = CloudMonitor::new(container.clone(), marker_filter(), Duration::from_millis(20));
        let mut latch = monitor.initial_download_complete();
        monitor.start().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!*latch.borrow());

        container.set_status(&a, DownloadStatus::Current);
        timeout(WAIT, latch.wait_for(|done| *done)).await.unwrap().unwrap();
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_failed_download_is_retried() {
        let tmp = TempDir::new().unwrap();
        let container = Arc::new(FakeContainer::new(Some(tmp.path().to_path_buf())));
        container.set_fail_downloads(true);
        let a = tmp.path().join("Backups/A/backup.info");
        container.set_status(&a, DownloadStatus::NotDownloaded);

        let mut monitor = CloudMonitor::new(container.clone(), marker_filter(), Duration::from_secs(60));
        monitor.start().unwrap();

        // Without a change or poll tick the failed request is not repeated
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(container.download_requests().len(), 1);

        container.set_status(&a, DownloadStatus::NotDownloaded);
        timeout(WAIT, async {
            while container.download_requests().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(container.download_requests().len(), 2);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_vanished_file_is_pruned() {
        let tmp = TempDir::new().unwrap();
        let container = Arc::new(FakeContainer::new(Some(tmp.path().to_path_buf())));
        let a = tmp.path().join("Backups/A/backup.info");
        container.set_status(&a, DownloadStatus::NotDownloaded);

        let mut monitor = CloudMonitor::new(container.clone(), marker_filter(), Duration::from_millis(20));
        let mut events = monitor.subscribe();
        monitor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Removing the only pending file completes the initial set
        container.forget(&a);
        assert_eq!(next_event(&mut events).await, MonitorEvent::InitialDownloadComplete);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected_and_stop_is_idempotent() {
        let container = Arc::new(FakeContainer::new(Some(Path::new("/nonexistent").to_path_buf())));
        let mut monitor = CloudMonitor::new(container, marker_filter(), Duration::from_millis(20));

        monitor.stop().await;
        monitor.start().unwrap();
        assert!(matches!(monitor.start(), Err(EngineError::MonitorAlreadyRunning)));
        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        monitor.start().unwrap();
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_no_events_after_stop() {
        let tmp = TempDir::new().unwrap();
        let container = Arc::new(FakeContainer::new(Some(tmp.path().to_path_buf())));
        let a = tmp.path().join("Backups/A/backup.info");
        container.set_status(&a, DownloadStatus::NotDownloaded);

        let mut monitor = CloudMonitor::new(container.clone(), marker_filter(), Duration::from_millis(10));
        let mut events = monitor.subscribe();
        monitor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        monitor.stop().await;

        container.set_status(&a, DownloadStatus::Current);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(events.try_recv().is_err());
    }
}
