//! EFISync Daemon - Background synchronization service
//!
//! This binary runs as a service on the ground station and handles:
//! - Periodic scans of the configured jobs and draining of the offline queue
//! - Reconciliation of removable EFIS volumes reported by the host
//! - Optionally, the receiving end of the transfer protocol
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Host control
//!
//! The host talks to the daemon over stdin, one line per message:
//!
//! - an absolute path reports a newly mounted volume
//! - `sync`, `pause`, `resume` drive the orchestrator
//! - `status` prints a JSON status snapshot to stdout

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use efisync_cache::{DatabasePool, SqliteRecordStore, SqliteTaskStore};
use efisync_core::{
    config::{Config, ConfigError, LoggingConfig},
    domain::TaskState,
    ports::{IEventSink, IRecordStore},
};
use efisync_sync::{
    connection::{ConnectionManager, TcpProbe},
    detector::ChangeDetector,
    events::TracingEventSink,
    media::{Fs2Space, MediaDeps, MediaReconciler},
    orchestrator::{OrchestratorDeps, SyncOrchestrator},
    queue::{OperationQueue, QueueSettings},
    retry::RetryPolicy,
    transfer::TransferEngine,
    wire::{TransferReceiver, WireClient},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the configuration path
const CONFIG_ENV: &str = "EFISYNC_CONFIG";

// ============================================================================
// Host commands
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum HostCommand {
    Volume(PathBuf),
    Sync,
    Pause,
    Resume,
    Status,
}

fn parse_command(line: &str) -> Option<HostCommand> {
    let line = line.trim();
    match line {
        "" => None,
        "sync" => Some(HostCommand::Sync),
        "pause" => Some(HostCommand::Pause),
        "resume" => Some(HostCommand::Resume),
        "status" => Some(HostCommand::Status),
        path if Path::new(path).is_absolute() => Some(HostCommand::Volume(PathBuf::from(path))),
        _ => None,
    }
}

// ============================================================================
// Configuration and logging
// ============================================================================

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path)
}

/// Load and validate the configuration; a missing file means defaults
fn load_config(path: &Path) -> Result<Config> {
    match Config::load_validated(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            let config = Config::default();
            let errors = config.validate();
            if !errors.is_empty() {
                return Err(ConfigError::Invalid(errors).into());
            }
            Ok(config)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to load {}", path.display())),
    }
}

fn init_logging(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

// ============================================================================
// DaemonService
// ============================================================================

struct DaemonService {
    config: Config,
    db_pool: DatabasePool,
    tasks: Arc<SqliteTaskStore>,
    orchestrator: SyncOrchestrator,
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Open the state database and wire every component
    async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let db_pool = DatabasePool::new(&config.sync.state_db)
            .await
            .context("Failed to open state database")?;
        let records: Arc<dyn IRecordStore> =
            Arc::new(SqliteRecordStore::new(db_pool.pool().clone()));
        let tasks = Arc::new(SqliteTaskStore::new(db_pool.pool().clone()));
        let events: Arc<dyn IEventSink> = Arc::new(TracingEventSink);

        let queue = Arc::new(
            OperationQueue::open(
                tasks.clone(),
                QueueSettings::from_config(&config.queue, &config.retry),
            )
            .await
            .context("Failed to restore the operation queue")?,
        );
        let detector = Arc::new(ChangeDetector::new(
            Arc::clone(&records),
            &config.sync.exclude,
            config.sync.stability_delay(),
        )?);
        let connection = Arc::new(ConnectionManager::new(
            &config.endpoint,
            Arc::new(TcpProbe),
        ));
        let wire = Arc::new(WireClient::new(&config.endpoint, &config.transfer));
        let executor =
            Arc::new(TransferEngine::new(&config.transfer).with_wire(Arc::clone(&wire)));

        let media = if config.media.enabled {
            Some(Arc::new(MediaReconciler::new(
                &config.media,
                &config.sync.exclude,
                RetryPolicy::from_config(&config.retry),
                MediaDeps {
                    records: Arc::clone(&records),
                    executor: executor.clone(),
                    space: Arc::new(Fs2Space),
                    events: Arc::clone(&events),
                },
            )?))
        } else {
            None
        };

        let orchestrator = SyncOrchestrator::new(OrchestratorDeps {
            config: config.clone(),
            queue,
            detector,
            connection,
            executor,
            catalog: wire,
            media,
            events,
        });

        Ok(Self {
            config,
            db_pool,
            tasks,
            orchestrator,
            shutdown,
        })
    }

    async fn start_receiver(&self) -> Result<Option<JoinHandle<()>>> {
        let receiver = &self.config.receiver;
        if !receiver.enabled {
            return Ok(None);
        }
        tokio::fs::create_dir_all(&receiver.root)
            .await
            .with_context(|| format!("Failed to create {}", receiver.root.display()))?;
        let listener = TcpListener::bind(&receiver.listen)
            .await
            .with_context(|| format!("Failed to listen on {}", receiver.listen))?;
        let server = Arc::new(TransferReceiver::new(
            receiver.root.clone(),
            &self.config.transfer,
            &self.config.sync.exclude,
        )?);
        let cancel = self.shutdown.child_token();
        Ok(Some(tokio::spawn(async move {
            if let Err(e) = server.serve(listener, cancel).await {
                error!(error = %e, "Receiver failed");
            }
        })))
    }

    async fn handle(&self, command: HostCommand) {
        match command {
            HostCommand::Volume(mount) => {
                if self.orchestrator.volume_sender().send(mount).await.is_err() {
                    warn!("Volume channel closed");
                }
            }
            HostCommand::Sync => self.orchestrator.request_cycle(),
            HostCommand::Pause => self.orchestrator.pause(),
            HostCommand::Resume => self.orchestrator.resume(),
            HostCommand::Status => {
                let snapshot = self.orchestrator.status_snapshot().await;
                match serde_json::to_string(&snapshot) {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!(error = %e, "Failed to serialize status"),
                }
            }
        }
    }

    /// Run until the shutdown token fires
    async fn run(&self) -> Result<()> {
        let receiver = self.start_receiver().await?;
        self.orchestrator.start().await?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => match parse_command(&line) {
                        Some(command) => self.handle(command).await,
                        None => warn!(line = %line.trim(), "Unrecognized host command"),
                    },
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!(error = %e, "Host input failed");
                        stdin_open = false;
                    }
                },
            }
        }

        self.orchestrator.stop().await;
        if let Some(handle) = receiver {
            let _ = handle.await;
        }
        self.log_persisted_queue().await;
        self.db_pool.close().await;
        Ok(())
    }

    /// Log what the next start will restore
    async fn log_persisted_queue(&self) {
        let queued = self.tasks.count_in_state(TaskState::Queued).await;
        let dead = self.tasks.count_in_state(TaskState::Dead).await;
        match (queued, dead) {
            (Ok(queued), Ok(dead)) => info!(queued, dead, "Persisted queue state"),
            (Err(e), _) | (_, Err(e)) => warn!(error = %e, "Failed to count persisted tasks"),
        }
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and cancels `token`
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let config = load_config(&path)?;
    init_logging(&config.logging);

    info!(
        config_path = %path.display(),
        jobs = config.sync.jobs.len(),
        "EFISync daemon starting (efisyncd)"
    );

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, shutdown_token.clone()).await?;
    let result = service.run().await;

    match &result {
        Ok(()) => info!("EFISync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "EFISync daemon exiting with error"),
    }

    result
}
