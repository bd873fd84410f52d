//! # Connection Sync Poller
//!
//! Timer loop that flags stale connections for resync, claims `SYNC_NEEDED`
//! connections into the work queue and feeds them to a fixed pool of sync
//! workers. The queue is bounded by the worker count so a tick never claims
//! more connections than the pool can start on.

use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use sea_orm::{DatabaseConnection, DbErr};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::repositories::ConnectionRepository;
use crate::sync_engine::{ConnectionSyncEngine, SyncOutcome};

/// How long in-flight syncs may keep running after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Background poller owning the connection sync worker pool.
pub struct ConnectionSyncPoller {
    connections: ConnectionRepository,
    engine: Arc<ConnectionSyncEngine>,
    config: SyncConfig,
}

#[derive(Debug, Default)]
struct TickStats {
    flagged: u64,
    claimed: usize,
}

impl ConnectionSyncPoller {
    pub fn new(
        db: Arc<DatabaseConnection>,
        engine: Arc<ConnectionSyncEngine>,
        config: SyncConfig,
    ) -> Self {
        Self {
            connections: ConnectionRepository::new(db),
            engine,
            config,
        }
    }

    /// Run until `shutdown` fires, then let in-flight syncs finish.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DbErr> {
        let reset = self.connections.reset_interrupted().await?;
        if reset > 0 {
            warn!(reset, "Re-queued connections interrupted by the previous run");
        }

        let worker_count = self.config.worker_count();
        info!(worker_count, "Starting connection sync poller");

        let (tx, rx) = mpsc::channel::<Uuid>(worker_count);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            workers.spawn(sync_worker(
                worker,
                rx.clone(),
                self.engine.clone(),
                shutdown.clone(),
            ));
        }

        let mut timer = tokio::time::interval(self.config.poll_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Connection sync poller shutdown requested");
                    break;
                }
                _ = timer.tick() => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(&tx).await {
                        error!(error = ?err, "Connection sync poller tick failed");
                    }
                    histogram!("connection_sync_poller_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        drop(tx);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Sync workers did not stop within the grace period, aborting");
            workers.abort_all();
        }

        info!("Connection sync poller stopped");
        Ok(())
    }

    async fn tick(&self, tx: &mpsc::Sender<Uuid>) -> Result<(), DbErr> {
        let mut stats = TickStats::default();
        let capacity = tx.capacity();

        stats.flagged = self.flag_stale().await?;
        let claimed = if capacity > 0 {
            self.connections.claim_for_sync(capacity as u64).await?
        } else {
            Vec::new()
        };
        stats.claimed = claimed.len();

        for connection_id in claimed {
            if tx.send(connection_id).await.is_err() {
                // Workers are gone; the row stays IN_SYNC_QUEUE until the next start.
                break;
            }
        }

        counter!("connection_sync_claimed_total").increment(stats.claimed as u64);
        gauge!("connection_sync_queue_depth").set((tx.max_capacity() - tx.capacity()) as f64);

        debug!(
            flagged = stats.flagged,
            claimed = stats.claimed,
            "Connection sync poller tick completed"
        );
        Ok(())
    }

    /// Flag connections whose last sync is older than the resync interval.
    pub async fn flag_stale(&self) -> Result<u64, DbErr> {
        let threshold =
            Utc::now() - chrono::Duration::seconds(self.config.resync_interval_seconds as i64);
        self.connections.flag_for_resync(threshold).await
    }
}

async fn sync_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    engine: Arc<ConnectionSyncEngine>,
    shutdown: CancellationToken,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(connection_id) = next else {
            break;
        };
        if shutdown.is_cancelled() {
            continue;
        }

        match engine.sync(connection_id).await {
            Ok(SyncOutcome::Skipped) => {
                debug!(worker, connection_id = %connection_id, "Sync skipped");
            }
            Ok(_) => {}
            Err(err) => {
                error!(
                    worker,
                    connection_id = %connection_id,
                    error = ?err,
                    "Failed to record connection sync result"
                );
            }
        }
    }
    debug!(worker, "Sync worker stopped");
}
