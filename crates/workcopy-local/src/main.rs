mod backup;
mod config;
mod dialogs;
mod session;
mod storage;
mod watch;

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workcopy_core::{ShutdownDecision, ShutdownReason, ShutdownSignal, StaticShutdownHost};
use workcopy_engine::{
    SaveAsCoordinator, TrackerServices, WorkingCopyBackupTracker, WorkingCopyRegistry,
};

use backup::FileBackupStore;
use config::Config;
use dialogs::{LogProgress, TerminalDialogs};
use session::{Exit, Session, TEXT};
use storage::LocalFileStorage;
use watch::StorageWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    info!("Starting workcopy-local");
    info!("  Auto save: {:?}", config.auto_save);
    info!("  Hot exit: {:?}", config.hot_exit);
    if config.development_mode {
        info!("  Development mode: shutdown is never blocked by backup errors");
    }

    let storage = Arc::new(LocalFileStorage::new(config.case_insensitive));

    let backup_dir = config.effective_backup_dir();
    let backups = Arc::new(FileBackupStore::open(&backup_dir).await?);
    info!("  Backup dir: {}", backups.root().display());

    let registry = WorkingCopyRegistry::new(storage.clone(), backups.clone());
    registry.watch_storage_changes();

    let watcher = match &config.workspace {
        Some(dir) => Some(StorageWatcher::start(dir, storage.clone())?),
        None => None,
    };
    if let Some(watcher) = &watcher {
        info!("  Workspace: {}", watcher.root().display());
    }

    let cwd = std::env::current_dir()?;
    let input = dialogs::stdin_input();
    let dialogs = Arc::new(TerminalDialogs::new(input.clone(), config.assume(), cwd.clone()));
    let progress = Arc::new(LogProgress::default());

    let save_as = Arc::new(SaveAsCoordinator::new(
        TEXT,
        registry.clone(),
        dialogs.clone(),
        config.save_as_config()?,
    ));

    let tracker = WorkingCopyBackupTracker::new(
        TrackerServices {
            registry: registry.clone(),
            backups: backups.clone(),
            dialogs,
            progress: progress.clone(),
            host: Arc::new(StaticShutdownHost::new(
                config.windows,
                config.workbench_state(),
            )),
            save_as: Some(save_as.clone()),
        },
        config.tracker_config(),
    );

    let unrestored = tracker.start().await?;
    if !unrestored.is_empty() {
        info!(
            "{} backup(s) from a previous session, use `restore` to open them",
            unrestored.len()
        );
    }

    let (shutdown, receiver) = ShutdownSignal::channel();
    let listener = tracker.listen(receiver);

    let session = Session::new(registry.clone(), save_as, tracker.clone(), input, cwd);
    println!("Type `help` for commands.");

    loop {
        let exit = session.run(shutdown_signal()).await;
        let decision = request_shutdown(&shutdown, &config, &progress).await;
        if !decision.veto {
            break;
        }
        if exit == Exit::EndOfInput {
            anyhow::bail!("Shutdown was vetoed and there is no input left to resolve it");
        }
        warn!("Shutdown vetoed, returning to the session");
    }

    listener.abort();
    registry.dispose();
    drop(watcher);

    info!("Shutdown complete");
    Ok(())
}

/// Ask the backup tracker for a shutdown decision.
///
/// An interrupt while waiting stops the slow step that shows progress, if any.
async fn request_shutdown(
    shutdown: &ShutdownSignal,
    config: &Config,
    progress: &LogProgress,
) -> ShutdownDecision {
    let request = shutdown.request(ShutdownReason::Quit, config.shutdown_budget());
    tokio::pin!(request);

    loop {
        tokio::select! {
            decision = &mut request => return decision,
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    return request.await;
                }
                if progress.cancel_current() {
                    info!("Stopped waiting for the current shutdown step");
                }
            }
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
            Err(e) => {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, initiating shutdown");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
