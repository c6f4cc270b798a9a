use backup_engine::BackupOrchestrator;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Runs automatic backups on a cron schedule. A run that fires while the
/// previous one is still going is skipped.
pub struct AutoBackupScheduler {
    scheduler: Mutex<JobScheduler>,
    orchestrator: BackupOrchestrator,
    running: Arc<Mutex<()>>,
}

impl AutoBackupScheduler {
    pub async fn new(orchestrator: BackupOrchestrator) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            orchestrator,
            running: Arc::new(Mutex::new(())),
        })
    }

    pub async fn schedule(&self, cron_expression: &str) -> anyhow::Result<()> {
        let orchestrator = self.orchestrator.clone();
        let running = self.running.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let orchestrator = orchestrator.clone();
            let running = running.clone();
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    tracing::warn!("Skipping scheduled backup: previous backup still running");
                    return;
                };

                tracing::info!("Starting scheduled backup");
                match orchestrator.backup().await {
                    Ok(entry) => tracing::info!(
                        directory = %entry.directory().display(),
                        size = %entry.display_size(),
                        "Scheduled backup complete"
                    ),
                    Err(e) => tracing::error!(error = %e, "Scheduled backup failed"),
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Automatic backup scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
