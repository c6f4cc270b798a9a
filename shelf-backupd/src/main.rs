//! shelf-backup - command-line front end for the library backup engine.

mod db;
mod scheduler;
mod store;

use anyhow::{bail, Context, Result};
use backup_engine::catalog::{self, BackupEntry};
use backup_engine::cloud::{CloudContainer, CloudMonitor, ItemFilter, MirrorContainer, MonitorEvent};
use backup_engine::daemon::ShutdownCoordinator;
use backup_engine::identity::{InstallationIdentity, LocalInstallation};
use backup_engine::marker::MARKER_FILE_NAME;
use backup_engine::prompt::RestorationPrompt;
use backup_engine::{utils, BackupOrchestrator, Config, EngineError, RestoreOrchestrator, RestoreOutcome};
use clap::{Parser, Subcommand};
use scheduler::AutoBackupScheduler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::SqliteStore;
use tokio::sync::broadcast::error::RecvError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up the library now
    Backup,
    /// List backups in the cloud container, most preferable first
    List,
    /// Restore the library from a backup
    Restore {
        /// Installation whose backup to restore; defaults to the best eligible one
        #[arg(long)]
        installation: Option<String>,
    },
    /// Delete the backup made by an installation
    Delete {
        #[arg(long)]
        installation: String,
    },
    /// Keep backup markers local and run scheduled backups until stopped
    Daemon,
    /// Print the effective configuration as TOML
    Config,
}

/// Collaborators shared by every command.
struct Engine {
    config: Config,
    container: Arc<dyn CloudContainer>,
    identity: Arc<dyn InstallationIdentity>,
}

impl Engine {
    fn new(config: Config) -> Result<Self> {
        let Some(remote_dir) = config.cloud.remote_dir.clone() else {
            bail!("cloud.remote_dir is not configured (set it in the config file or SHELF__CLOUD__REMOTE_DIR)");
        };
        let container: Arc<dyn CloudContainer> =
            Arc::new(MirrorContainer::new(remote_dir, config.cloud.cache_dir.clone()));
        let identity: Arc<dyn InstallationIdentity> = Arc::new(LocalInstallation::new(
            &config.device.data_dir,
            config.device.name.clone(),
            config.device.class,
        ));
        Ok(Self {
            config,
            container,
            identity,
        })
    }

    fn open_store(&self) -> Result<Arc<SqliteStore>> {
        let store = SqliteStore::open(&self.config.store.path)
            .with_context(|| format!("opening library database {}", self.config.store.path.display()))?;
        tracing::debug!(path = %store.path().display(), "Library database open");
        Ok(Arc::new(store))
    }

    fn backup_orchestrator(&self, store: Arc<SqliteStore>) -> BackupOrchestrator {
        BackupOrchestrator::new(
            store,
            Arc::clone(&self.container),
            Arc::clone(&self.identity),
            self.config.archive_options(),
            self.config.scratch_dir(),
        )
    }

    fn catalog_monitor(&self) -> CloudMonitor {
        CloudMonitor::new(
            Arc::clone(&self.container),
            ItemFilter::FileName(MARKER_FILE_NAME.to_string()),
            self.config.poll_interval(),
        )
    }

    /// Start a catalog monitor and give it the prompt timeout to pull markers
    /// down. Returns the running monitor so the caller decides when to stop it.
    async fn synced_catalog(&self) -> Result<CloudMonitor> {
        let mut monitor = self.catalog_monitor();
        monitor.start()?;
        let mut latch = monitor.initial_download_complete();
        if tokio::time::timeout(self.config.prompt_timeout(), latch.wait_for(|done| *done))
            .await
            .is_err()
        {
            tracing::warn!("Not every backup marker downloaded in time; the list may be incomplete");
        }
        Ok(monitor)
    }

    async fn read_backups(&self) -> Result<Vec<BackupEntry>> {
        let container = Arc::clone(&self.container);
        let identity = Arc::clone(&self.identity);
        let entries = tokio::task::spawn_blocking(move || {
            catalog::read_backups(container.as_ref(), identity.installation_id().as_deref())
        })
        .await?;
        Ok(entries)
    }

    async fn find_backup(&self, installation: &str) -> Result<BackupEntry> {
        self.read_backups()
            .await?
            .into_iter()
            .find(|entry| entry.marker().device_vendor_id == installation)
            .ok_or_else(|| EngineError::BackupNotFound(installation.to_string()).into())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    if let Command::Config = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!("Starting shelf-backup v{}", env!("CARGO_PKG_VERSION"));
    let engine = Engine::new(config)?;

    match args.command {
        Command::Backup => run_backup(&engine).await,
        Command::List => run_list(&engine).await,
        Command::Restore { installation } => run_restore(&engine, installation.as_deref()).await,
        Command::Delete { installation } => run_delete(&engine, &installation).await,
        Command::Daemon => run_daemon(&engine).await,
        Command::Config => Ok(()),
    }
}

async fn run_backup(engine: &Engine) -> Result<()> {
    let store = engine.open_store()?;
    let entry = engine.backup_orchestrator(store).backup().await?;
    println!("Backed up to {} ({})", entry.directory().display(), entry.display_size());
    Ok(())
}

async fn run_list(engine: &Engine) -> Result<()> {
    let mut monitor = engine.synced_catalog().await?;
    let entries = engine.read_backups().await;
    monitor.stop().await;
    let entries = entries?;

    if entries.is_empty() {
        println!("No backups found");
        return Ok(());
    }

    let store = engine.open_store()?;
    let current = engine.identity.installation_id();
    let device_class = engine.identity.device_class();
    for entry in &entries {
        let mut flags = Vec::new();
        if entry.is_from_installation(current.as_deref()) {
            flags.push("this installation");
        }
        if !entry.is_restorable_on(device_class, store.as_ref()) {
            flags.push("not restorable here");
        }
        let suffix = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!("{}  {}{}", entry.marker().device_vendor_id, entry.description(), suffix);
    }
    Ok(())
}

async fn run_restore(engine: &Engine, installation: Option<&str>) -> Result<()> {
    let store = engine.open_store()?;
    let mut monitor = engine.catalog_monitor();
    monitor.start()?;

    let entry = match installation {
        Some(id) => {
            let mut latch = monitor.initial_download_complete();
            let _ = tokio::time::timeout(engine.config.prompt_timeout(), latch.wait_for(|done| *done)).await;
            engine.find_backup(id).await
        }
        None => {
            let prompt = RestorationPrompt::new(
                Arc::clone(&engine.container),
                store.clone(),
                Arc::clone(&engine.identity),
            );
            prompt
                .find_candidate(monitor.initial_download_complete(), engine.config.prompt_timeout())
                .await
                .context("no eligible backup to restore")
        }
    };
    // The library is about to be replaced; nothing else may hold the store
    monitor.stop().await;
    let entry = entry?;

    if !entry.is_restorable_on(engine.identity.device_class(), store.as_ref()) {
        bail!(
            "backup from {} cannot be restored on this device",
            entry.marker().device_name
        );
    }
    println!("Restoring {}", entry.description());

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let cancel = shutdown.token();
    let mut restorer = RestoreOrchestrator::new(
        store.clone(),
        Arc::clone(&engine.container),
        engine.config.scratch_dir(),
        engine.config.poll_interval(),
    );
    if let Some(timeout) = engine.config.download_timeout() {
        restorer = restorer.with_download_timeout(timeout);
    }

    // A signal only cancels the download; once the store files are being
    // replaced the restore runs to completion
    let signals = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if let Err(e) = shutdown.wait_for_signal().await {
                tracing::warn!(error = %e, "Cannot listen for shutdown signals");
            }
        })
    };
    let outcome = restorer.restore(&entry, cancel).await;
    signals.abort();

    match outcome {
        Ok(RestoreOutcome::Restored) => {
            println!("Library restored ({} books)", store.book_count()?);
            Ok(())
        }
        Ok(RestoreOutcome::Cancelled) => {
            println!("Restore cancelled; the library was not changed");
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.user_message());
            Err(e.into())
        }
    }
}

async fn run_delete(engine: &Engine, installation: &str) -> Result<()> {
    let mut monitor = engine.synced_catalog().await?;
    let entry = engine.find_backup(installation).await;
    monitor.stop().await;
    let entry = entry?;

    let container = Arc::clone(&engine.container);
    let target = entry.clone();
    tokio::task::spawn_blocking(move || catalog::delete_backup(container.as_ref(), &target)).await??;
    println!("Deleted backup from {}", entry.marker().device_name);
    Ok(())
}

async fn run_daemon(engine: &Engine) -> Result<()> {
    let store = engine.open_store()?;
    let shutdown = ShutdownCoordinator::new();

    let mut monitor = engine.catalog_monitor();
    let mut events = monitor.subscribe();
    monitor.start()?;

    let cancel = shutdown.token();
    let event_log = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(MonitorEvent::InitialDownloadComplete) => tracing::info!("Backup markers are up to date"),
                    Ok(MonitorEvent::FileDownloaded(path)) => {
                        tracing::info!(path = %path.display(), "Backup marker downloaded")
                    }
                    Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Monitor events lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    let scheduler = match engine.config.backup.schedule.as_deref() {
        Some(cron) => {
            let scheduler = AutoBackupScheduler::new(engine.backup_orchestrator(store.clone())).await?;
            scheduler.schedule(cron).await?;
            scheduler.start().await?;
            Some(scheduler)
        }
        None => {
            tracing::info!("No backup schedule configured; watching backups only");
            None
        }
    };

    shutdown.wait_for_signal().await?;

    if let Some(scheduler) = &scheduler {
        if let Err(e) = scheduler.shutdown().await {
            tracing::warn!(error = %e, "Failed to stop backup scheduler");
        }
    }
    shutdown
        .drain(SHUTDOWN_GRACE, async {
            monitor.stop().await;
            let _ = event_log.await;
        })
        .await;
    Ok(())
}
