//! First-launch restoration prompt.
//!
//! On a fresh install the catalog monitor starts pulling markers down. The
//! prompt waits briefly for that first pass so it can offer the best backup
//! without holding up launch when the cloud is slow.

use crate::catalog::{best_backup, eligible_backups, read_backups, BackupEntry};
use crate::cloud::CloudContainer;
use crate::identity::InstallationIdentity;
use crate::store::PersistentStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct RestorationPrompt {
    container: Arc<dyn CloudContainer>,
    store: Arc<dyn PersistentStore>,
    identity: Arc<dyn InstallationIdentity>,
}

impl RestorationPrompt {
    pub fn new(
        container: Arc<dyn CloudContainer>,
        store: Arc<dyn PersistentStore>,
        identity: Arc<dyn InstallationIdentity>,
    ) -> Self {
        Self {
            container,
            store,
            identity,
        }
    }

    /// Wait up to `timeout` for `initial_download` to latch, then return the
    /// most preferable backup this installation may restore. `None` when the
    /// wait times out, the monitor went away, or nothing is eligible.
    pub async fn find_candidate(
        &self,
        mut initial_download: watch::Receiver<bool>,
        timeout: Duration,
    ) -> Option<BackupEntry> {
        match tokio::time::timeout(timeout, initial_download.wait_for(|done| *done)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                debug!("Catalog monitor stopped before its initial download completed");
                return None;
            }
            Err(_) => {
                info!(timeout_secs = timeout.as_secs_f64(), "Backups not downloaded in time, skipping restore prompt");
                return None;
            }
        }

        let container = Arc::clone(&self.container);
        let store = Arc::clone(&self.store);
        let identity = Arc::clone(&self.identity);
        tokio::task::spawn_blocking(move || {
            let installation_id = identity.installation_id();
            let entries = read_backups(container.as_ref(), installation_id.as_deref());
            let eligible = eligible_backups(&entries, identity.device_class(), store.as_ref());
            best_backup(&eligible, installation_id.as_deref()).cloned()
        })
        .await
        .ok()
        .flatten()
    }
}
