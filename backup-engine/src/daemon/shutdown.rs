//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the coordinator's token; long-running work (the catalog
//! monitor, scheduled backups, a pending restore download) holds a child token
//! and winds down on its own. A restore already replacing store files is not
//! interrupted.

use std::io;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Begin shutdown without waiting for a signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM (or an earlier [`Self::trigger`]), then
    /// cancel every handed-out token.
    pub async fn wait_for_signal(&self) -> io::Result<()> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        #[cfg(unix)]
        let terminate = async move {
            terminate.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT, shutting down");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down");
            }
            _ = self.token.cancelled() => {
                info!("Shutdown requested");
            }
        }

        self.token.cancel();
        Ok(())
    }

    /// Give tasks holding a token up to `grace` to finish `work`.
    pub async fn drain<F>(&self, grace: Duration, work: F) -> bool
    where
        F: std::future::Future<Output = ()>,
    {
        match tokio::time::timeout(grace, work).await {
            Ok(()) => {
                info!("Graceful shutdown complete");
                true
            }
            Err(_) => {
                info!(grace_secs = grace.as_secs(), "Shutdown grace period elapsed");
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
