//! # Index Job Scheduler
//!
//! Background task that scans the repo catalog on a fixed timer and creates
//! INDEX jobs for repos that are due for (re)indexing and CLEANUP jobs for
//! orphaned repos past their grace period. Job rows are committed before the
//! job worker is woken, and the partial unique index on `repo_jobs` guarantees
//! at most one active job per repo even when several instances scan at once.
//! The same tick fails jobs that have been running longer than the job timeout.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use sea_orm::sea_query::{Query, SelectStatement};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect,
};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::IndexingConfig;
use crate::db::to_db_time;
use crate::models::repo::{Column as RepoColumn, Entity as Repo};
use crate::models::repo_job::{self, RepoJobStatus, RepoJobType};
use crate::models::repo_to_connection;
use crate::repositories::RepoJobRepository;

/// Default number of repos scheduled per scan.
const DEFAULT_BATCH_SIZE: u64 = 500;

/// Background scheduler service.
pub struct IndexJobScheduler {
    db: Arc<DatabaseConnection>,
    jobs: RepoJobRepository,
    config: IndexingConfig,
    notify: Arc<Notify>,
    batch_size: u64,
}

#[derive(Debug, Default)]
struct TickStats {
    index_jobs: usize,
    cleanup_jobs: usize,
    stalled: u64,
}

impl IndexJobScheduler {
    /// `notify` wakes the job worker after new jobs are committed.
    pub fn new(db: Arc<DatabaseConnection>, config: IndexingConfig, notify: Arc<Notify>) -> Self {
        Self {
            jobs: RepoJobRepository::new(db.clone()),
            db,
            config,
            notify,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Override the number of repos scheduled per scan (primarily for tests).
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting index job scheduler");
        let mut timer = tokio::time::interval(self.config.poll_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Index job scheduler shutdown requested");
                    break;
                }
                _ = timer.tick() => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = ?err, "Index scheduler tick failed");
                    }
                    histogram!("index_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Index job scheduler stopped");
    }

    /// One scheduling pass: stall sweep, then index and cleanup scans.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), DbErr> {
        let mut stats = TickStats::default();

        stats.stalled = self.sweep_stalled(now).await?;
        stats.index_jobs = self.schedule_index_jobs(now).await?.len();
        stats.cleanup_jobs = self.schedule_cleanup_jobs(now).await?.len();

        if stats.index_jobs + stats.cleanup_jobs > 0 {
            self.notify.notify_one();
        }

        debug!(
            index_jobs = stats.index_jobs,
            cleanup_jobs = stats.cleanup_jobs,
            stalled = stats.stalled,
            "Index scheduler tick completed"
        );
        Ok(())
    }

    /// Create INDEX jobs for repos never indexed or indexed before the reindex interval.
    pub async fn schedule_index_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<repo_job::Model>, DbErr> {
        let threshold = now - Duration::seconds(self.config.reindex_interval_seconds as i64);

        let candidates: Vec<Uuid> = Repo::find()
            .select_only()
            .column(RepoColumn::Id)
            .filter(stale_since(threshold))
            .filter(RepoColumn::Id.not_in_subquery(busy_repos(RepoJobType::Index, threshold)))
            .order_by_asc(RepoColumn::CreatedAt)
            .limit(self.batch_size)
            .into_tuple()
            .all(self.db.as_ref())
            .await?;

        self.create_jobs(RepoJobType::Index, candidates).await
    }

    /// Create CLEANUP jobs for repos with no connections left whose grace period elapsed.
    pub async fn schedule_cleanup_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<repo_job::Model>, DbErr> {
        let threshold = now - Duration::seconds(self.config.gc_grace_period_seconds as i64);

        let linked = Query::select()
            .column(repo_to_connection::Column::RepoId)
            .from(repo_to_connection::Entity)
            .to_owned();

        let candidates: Vec<Uuid> = Repo::find()
            .select_only()
            .column(RepoColumn::Id)
            .filter(RepoColumn::Id.not_in_subquery(linked))
            .filter(stale_since(threshold))
            .filter(RepoColumn::Id.not_in_subquery(busy_repos(RepoJobType::Cleanup, threshold)))
            .order_by_asc(RepoColumn::CreatedAt)
            .limit(self.batch_size)
            .into_tuple()
            .all(self.db.as_ref())
            .await?;

        self.create_jobs(RepoJobType::Cleanup, candidates).await
    }

    /// Fail IN_PROGRESS jobs that outlived the job timeout.
    pub async fn sweep_stalled(&self, now: DateTime<Utc>) -> Result<u64, DbErr> {
        let started_before = now - Duration::seconds(self.config.job_timeout_seconds as i64);
        let stalled = self.jobs.fail_stalled(started_before, now).await?;
        if stalled > 0 {
            warn!(stalled, "Marked stalled repo jobs as failed");
            counter!("index_scheduler_stalled_total").increment(stalled);
        }
        Ok(stalled)
    }

    async fn create_jobs(
        &self,
        job_type: RepoJobType,
        repo_ids: Vec<Uuid>,
    ) -> Result<Vec<repo_job::Model>, DbErr> {
        let label = job_type_label(job_type);
        let mut created = Vec::with_capacity(repo_ids.len());

        for repo_id in repo_ids {
            match self.jobs.create(job_type, repo_id).await? {
                Some(job) => {
                    debug!(repo_id = %repo_id, job_id = %job.id, job_type = label, "Created repo job");
                    created.push(job);
                }
                None => {
                    counter!("index_scheduler_jobs_skipped_total", "type" => label).increment(1);
                }
            }
        }

        if !created.is_empty() {
            info!(count = created.len(), job_type = label, "Scheduled repo jobs");
            counter!("index_scheduler_jobs_created_total", "type" => label)
                .increment(created.len() as u64);
        }
        Ok(created)
    }
}

pub(crate) fn job_type_label(job_type: RepoJobType) -> &'static str {
    match job_type {
        RepoJobType::Index => "index",
        RepoJobType::Cleanup => "cleanup",
    }
}

/// `indexed_at IS NULL OR indexed_at < threshold`
fn stale_since(threshold: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(RepoColumn::IndexedAt.is_null())
        .add(RepoColumn::IndexedAt.lt(to_db_time(threshold)))
}

/// Repos that must not get a new `job_type` job: any active job, or a job of
/// the same type created or failed after `threshold`.
fn busy_repos(job_type: RepoJobType, threshold: DateTime<Utc>) -> SelectStatement {
    let threshold = to_db_time(threshold);

    let recent_of_type = Condition::all()
        .add(repo_job::Column::JobType.eq(job_type))
        .add(
            Condition::any()
                .add(
                    Condition::all()
                        .add(repo_job::Column::Status.is_in(RepoJobStatus::ACTIVE))
                        .add(repo_job::Column::CreatedAt.gt(threshold)),
                )
                .add(
                    Condition::all()
                        .add(repo_job::Column::Status.eq(RepoJobStatus::Failed))
                        .add(repo_job::Column::CompletedAt.gt(threshold)),
                ),
        );

    Query::select()
        .column(repo_job::Column::RepoId)
        .from(repo_job::Entity)
        .cond_where(
            Condition::any()
                .add(repo_job::Column::Status.is_in(RepoJobStatus::ACTIVE))
                .add(recent_of_type),
        )
        .to_owned()
}
