//! # Repo Sync Main Entry Point
//!
//! `serve` runs the operator API together with the connection sync poller, the
//! index job scheduler and the job worker. `migrate` only applies migrations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sea_orm::DatabaseConnection;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use repo_sync::{
    config::{AppConfig, ConfigLoader, ConnectionsFile, connections::DECLARATIVE_ORG_ID},
    connectors::{HttpClient, Registry, TokenResolver},
    crypto::CryptoKey,
    db,
    git::CliGit,
    indexer::CommandIndexer,
    job_worker::{JobWorker, JobWorkerSettings},
    migration::{Migrator, MigratorTrait},
    repositories::ConnectionRepository,
    retry::RetryingFetcher,
    scheduler::IndexJobScheduler,
    server::run_server,
    sync_engine::ConnectionSyncEngine,
    sync_poller::ConnectionSyncPoller,
    telemetry::{self, LoggingErrorReporter, SharedErrorReporter},
};

#[derive(Debug, Parser)]
#[command(name = "repo-sync", version, about = "Code host sync and indexing service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the operator API and background services (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;
    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Effective configuration");
    }

    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None)
        .await
        .context("applying database migrations")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            info!("Migrations applied");
            Ok(())
        }
        Command::Serve => serve(config, Arc::new(db)).await,
    }
}

async fn serve(config: AppConfig, db: Arc<DatabaseConnection>) -> Result<()> {
    let metrics = telemetry::init_metrics().context("installing metrics recorder")?;

    if let Some(path) = &config.connections_file {
        let file = ConnectionsFile::load(path).context("loading connections file")?;
        let stats = file
            .apply(&ConnectionRepository::new(db.clone()), DECLARATIVE_ORG_ID)
            .await
            .context("applying connections file")?;
        info!(
            path = %path.display(),
            created = stats.created,
            changed = stats.changed,
            unchanged = stats.unchanged,
            deleted = stats.deleted,
            "Applied connections file"
        );
    }

    let crypto_key = config
        .crypto_key
        .clone()
        .map(CryptoKey::new)
        .transpose()
        .context("initializing crypto key")?;
    let tokens = TokenResolver::new(db.clone(), crypto_key);
    let reporter: SharedErrorReporter = Arc::new(LoggingErrorReporter);

    let http = HttpClient::new(RetryingFetcher::from_config(&config.retry))
        .context("building code host HTTP client")?;
    let registry = Arc::new(Registry::with_default_adapters(http));
    info!(types = ?registry.list_types(), "Registered code host adapters");

    let engine = Arc::new(ConnectionSyncEngine::new(
        db.clone(),
        registry,
        tokens.clone(),
        reporter.clone(),
        config.sync.timeout(),
    ));

    let indexer = CommandIndexer::new(&config.indexing.indexer_command, config.index_dir.clone())
        .context("configuring indexer")?;
    let notify = Arc::new(Notify::new());
    let worker = Arc::new(JobWorker::new(
        db.clone(),
        Arc::new(CliGit::default()),
        Arc::new(indexer),
        tokens,
        reporter,
        JobWorkerSettings::from_config(&config),
        notify.clone(),
    ));

    let timers = CancellationToken::new();
    let workers = CancellationToken::new();
    let http_shutdown = CancellationToken::new();

    let poller = ConnectionSyncPoller::new(db.clone(), engine, config.sync.clone());
    let poller_handle = tokio::spawn(poller.run(timers.clone()));
    let scheduler = IndexJobScheduler::new(db.clone(), config.indexing.clone(), notify);
    let scheduler_handle = tokio::spawn(scheduler.run(timers.clone()));
    let worker_handle = tokio::spawn(worker.run(workers.clone()));
    let upkeep_handle = tokio::spawn(telemetry::run_metrics_upkeep(
        metrics.clone(),
        http_shutdown.clone(),
    ));

    let server_config = config.clone();
    let server_token = http_shutdown.clone();
    let mut server_handle = tokio::spawn(async move {
        run_server(&server_config, db, metrics, server_token).await
    });

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        result = &mut server_handle => {
            // The API stopped on its own; stop the services and surface why.
            timers.cancel();
            workers.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(60), async {
                let _ = poller_handle.await;
                let _ = scheduler_handle.await;
                let _ = worker_handle.await;
            })
            .await;
            return result.context("operator API task failed")?;
        }
    }

    timers.cancel();
    match poller_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = ?err, "Connection sync poller failed"),
        Err(err) => error!(error = ?err, "Connection sync poller panicked"),
    }
    if let Err(err) = scheduler_handle.await {
        error!(error = ?err, "Index job scheduler panicked");
    }

    workers.cancel();
    if let Err(err) = worker_handle.await {
        error!(error = ?err, "Repo job worker panicked");
    }

    http_shutdown.cancel();
    let _ = upkeep_handle.await;
    server_handle
        .await
        .context("operator API task failed")??;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = ?err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = ?err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
