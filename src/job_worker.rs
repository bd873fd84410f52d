//! # Job Worker
//!
//! Claims PENDING repo jobs and runs them on a bounded pool. INDEX jobs clone or
//! fetch the repo into `repos_dir/{repo_id}` and hand the working copy to the
//! [`Indexer`]; CLEANUP jobs delete the clone and the repo's index shards and
//! then remove the repo from the catalog.
//!
//! A job is claimed with a guarded `PENDING -> IN_PROGRESS` update, and the
//! partial unique index on `repo_jobs` allows only one active job per repo, so
//! an INDEX and a CLEANUP for the same repo never run at the same time.
//! Completion, failure and stall transitions are also guarded; errors raised
//! while recording them are reported and never stop the worker.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use sea_orm::{DatabaseConnection, DbErr};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::config::AppConfig;
use crate::connectors::{ConnectionConfig, TokenResolver, git_auth_header};
use crate::error::JobError;
use crate::git::{Git, LEGACY_ORIGIN_URL_KEY, RefKind};
use crate::glob::GlobSet;
use crate::indexer::{IndexRequest, Indexer, shard_prefix};
use crate::models::repo::{self, RepoMetadata};
use crate::models::repo_job::{self, RepoJobType};
use crate::repositories::repo_job::STALLED_MESSAGE;
use crate::repositories::{ConnectionRepository, IndexOutcome, RepoJobRepository, RepoRepository};
use crate::scheduler::job_type_label;
use crate::telemetry::SharedErrorReporter;

/// Error message recorded on jobs abandoned because the process shut down.
pub const SHUTDOWN_MESSAGE: &str = "interrupted by shutdown";

/// Settings for the job worker, usually taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct JobWorkerSettings {
    pub repos_dir: PathBuf,
    pub index_dir: PathBuf,
    pub max_concurrency: usize,
    pub job_timeout: Duration,
    pub max_revisions: usize,
    pub poll_interval: Duration,
    /// How long running jobs may continue after shutdown is requested
    pub shutdown_grace: Duration,
}

impl JobWorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            repos_dir: config.repos_dir.clone(),
            index_dir: config.index_dir.clone(),
            max_concurrency: config.indexing.max_concurrency.max(1),
            job_timeout: config.indexing.job_timeout(),
            max_revisions: config.indexing.max_revisions,
            poll_interval: config.indexing.poll_interval(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Stalled,
    Interrupted,
}

/// Where a repo lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPath {
    pub path: PathBuf,
    /// `file://` repos are used in place and never modified
    pub read_only: bool,
}

/// Pool of workers executing INDEX and CLEANUP jobs.
pub struct JobWorker {
    jobs: RepoJobRepository,
    repos: RepoRepository,
    connections: ConnectionRepository,
    git: Arc<dyn Git>,
    indexer: Arc<dyn Indexer>,
    tokens: TokenResolver,
    reporter: SharedErrorReporter,
    settings: JobWorkerSettings,
    notify: Arc<Notify>,
    permits: Arc<Semaphore>,
}

impl JobWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        git: Arc<dyn Git>,
        indexer: Arc<dyn Indexer>,
        tokens: TokenResolver,
        reporter: SharedErrorReporter,
        settings: JobWorkerSettings,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            jobs: RepoJobRepository::new(db.clone()),
            repos: RepoRepository::new(db.clone()),
            connections: ConnectionRepository::new(db),
            git,
            indexer,
            tokens,
            reporter,
            permits: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            settings,
            notify,
        }
    }

    /// Dispatch jobs until `shutdown` fires, then wait for running jobs.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            max_concurrency = self.settings.max_concurrency,
            "Starting repo job worker"
        );
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Repo job worker shutdown requested");
                    break;
                }
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = ?err, "Repo job task panicked");
                    }
                }
            }

            if let Err(err) = Self::dispatch(&self, &mut running, &shutdown).await {
                error!(error = ?err, "Failed to dispatch repo jobs");
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                error!(error = ?err, "Repo job task panicked");
            }
        }
        info!("Repo job worker stopped");
    }

    /// Claim and run every job that is pending right now, up to the pool size,
    /// and wait for them to finish. Returns how many jobs ran.
    pub async fn run_pending(worker: &Arc<Self>) -> Result<usize, DbErr> {
        let mut running = JoinSet::new();
        let shutdown = CancellationToken::new();
        let started = Self::dispatch(worker, &mut running, &shutdown).await?;
        while running.join_next().await.is_some() {}
        Ok(started)
    }

    async fn dispatch(
        worker: &Arc<Self>,
        running: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Result<usize, DbErr> {
        let available = worker.permits.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let mut started = 0;
        for job_id in worker.jobs.pending_ids(available as u64).await? {
            let Ok(permit) = worker.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(job) = worker.jobs.claim(job_id).await? else {
                continue;
            };

            started += 1;
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            let span = info_span!(
                "repo_job",
                job_id = %job.id,
                repo_id = %job.repo_id,
                job_type = job_type_label(job.job_type)
            );
            running.spawn(
                async move {
                    let _permit = permit;
                    worker.execute(job, shutdown).await;
                }
                .instrument(span),
            );
        }

        Ok(started)
    }

    /// Run a claimed job to a terminal state.
    pub async fn execute(&self, job: repo_job::Model, shutdown: CancellationToken) -> JobOutcome {
        let label = job_type_label(job.job_type);
        let started = Instant::now();
        gauge!("repo_job_in_flight").increment(1.0);
        let _in_flight = scopeguard::guard((), |()| gauge!("repo_job_in_flight").decrement(1.0));
        info!("Repo job started");

        let interrupted = async {
            shutdown.cancelled().await;
            tokio::time::sleep(self.settings.shutdown_grace).await;
        };

        let result = tokio::select! {
            result = tokio::time::timeout(self.settings.job_timeout, self.perform(&job)) => Some(result),
            _ = interrupted => None,
        };

        let outcome = match result {
            Some(Ok(Ok(index))) => {
                self.on_completed(&job, index).await;
                JobOutcome::Completed
            }
            Some(Ok(Err(err))) => {
                self.reporter.report("repo_job", &err);
                let message = err.to_string();
                self.on_failed(&job, &message).await;
                JobOutcome::Failed(message)
            }
            Some(Err(_)) => {
                self.on_failed(&job, STALLED_MESSAGE).await;
                JobOutcome::Stalled
            }
            None => {
                self.on_failed(&job, SHUTDOWN_MESSAGE).await;
                JobOutcome::Interrupted
            }
        };

        let status = match &outcome {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::Stalled => "stalled",
            JobOutcome::Interrupted => "interrupted",
        };
        counter!("repo_job_total", "type" => label, "status" => status).increment(1);
        histogram!("repo_job_duration_ms", "type" => label)
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        info!(status, elapsed_ms = started.elapsed().as_millis() as u64, "Repo job finished");

        outcome
    }

    async fn perform(&self, job: &repo_job::Model) -> Result<Option<IndexOutcome>, JobError> {
        let repo = self
            .repos
            .get_by_id(job.repo_id)
            .await?
            .ok_or(JobError::RepoMissing(job.repo_id))?;

        match job.job_type {
            RepoJobType::Index => self.index_repository(&repo).await.map(Some),
            RepoJobType::Cleanup => self.cleanup_repository(&repo).await.map(|()| None),
        }
    }

    async fn index_repository(&self, repo: &repo::Model) -> Result<IndexOutcome, JobError> {
        let RepoPath { path, read_only } = self.repo_path(repo);
        let metadata = RepoMetadata::from_json(&repo.metadata);
        let repo_id = repo.id;
        let on_progress = move |line: &str| debug!(repo_id = %repo_id, "git: {}", line);

        if read_only {
            if !path.is_dir() {
                return Err(JobError::Git(format!(
                    "local repository {} does not exist",
                    path.display()
                )));
            }
        } else {
            let auth_header = self.auth_header(repo).await?;
            let auth_header = auth_header.as_ref().map(|h| h.as_str());

            if path.exists() && !self.git.is_valid_git_repo_root(&path).await {
                warn!(
                    path = %path.display(),
                    "Not a valid git repository root, deleting and cloning again"
                );
                tokio::fs::remove_dir_all(&path).await?;
            }

            let started = Instant::now();
            if path.exists() {
                self.git
                    .unset_git_config(&path, &[LEGACY_ORIGIN_URL_KEY])
                    .await?;
                self.git
                    .fetch(&repo.clone_url, auth_header, &path, &on_progress)
                    .await?;
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Fetched {}", repo.name);
            } else {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                self.git
                    .clone_repo(&repo.clone_url, auth_header, &path, &on_progress)
                    .await?;
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Cloned {}", repo.name);
            }

            if !metadata.git_config.is_empty() {
                self.git
                    .upsert_git_config(&path, &metadata.git_config)
                    .await?;
            }
        }

        let revisions = self.revisions(repo, &path, &metadata).await?;
        let request = IndexRequest {
            repo_id: repo.id,
            org_id: repo.org_id,
            repo_path: path.clone(),
            revisions,
        };

        let started = Instant::now();
        self.indexer.index_repository(&request).await?;
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Indexed {}", repo.name);

        let commit_hash = self.git.head_commit(&path).await?;
        Ok(IndexOutcome {
            commit_hash,
            revisions: request.revisions,
        })
    }

    async fn cleanup_repository(&self, repo: &repo::Model) -> Result<(), JobError> {
        let RepoPath { path, read_only } = self.repo_path(repo);
        if !read_only && path.exists() {
            info!(path = %path.display(), "Deleting repo directory");
            tokio::fs::remove_dir_all(&path).await?;
        }

        let removed = delete_shards(&self.settings.index_dir, &shard_prefix(repo.org_id, repo.id))
            .await?;
        debug!(removed, "Deleted index shards");
        Ok(())
    }

    /// `HEAD` plus the branches and tags matching the repo's revision globs.
    async fn revisions(
        &self,
        repo: &repo::Model,
        path: &Path,
        metadata: &RepoMetadata,
    ) -> Result<Vec<String>, JobError> {
        let mut revisions = vec!["HEAD".to_string()];
        if metadata.branches.is_none() && metadata.tags.is_none() {
            return Ok(revisions);
        }

        let branches = revision_globs(metadata.branches.as_deref());
        let tags = revision_globs(metadata.tags.as_deref());
        let refs = self.git.list_refs(path).await?;

        for kind in [RefKind::Branch, RefKind::Tag] {
            let (globs, prefix) = match kind {
                RefKind::Branch => (&branches, "refs/heads/"),
                RefKind::Tag => (&tags, "refs/tags/"),
            };
            let Some(globs) = globs else {
                continue;
            };
            revisions.extend(
                refs.iter()
                    .filter(|r| r.kind == kind && globs.is_match(&r.name))
                    .map(|r| format!("{}{}", prefix, r.name)),
            );
        }

        if revisions.len() > self.settings.max_revisions {
            warn!(
                repo_id = %repo.id,
                count = revisions.len(),
                max = self.settings.max_revisions,
                "Too many revisions, truncating"
            );
            counter!("repo_job_revisions_truncated_total").increment(1);
            revisions.truncate(self.settings.max_revisions);
        }
        Ok(revisions)
    }

    /// Authorization header for clone and fetch, from the first connection
    /// that still links the repo.
    async fn auth_header(&self, repo: &repo::Model) -> Result<Option<Zeroizing<String>>, JobError> {
        for connection_id in self.repos.connection_ids(repo.id).await? {
            let Some(connection) = self.connections.get_by_id(connection_id).await? else {
                continue;
            };
            let config = ConnectionConfig::parse(&connection.config, &connection.connection_type)?;
            let Some(token) = self.tokens.resolve_for(connection.org_id, &config).await? else {
                return Ok(None);
            };
            return Ok(git_auth_header(&config, &token));
        }
        Ok(None)
    }

    pub fn repo_path(&self, repo: &repo::Model) -> RepoPath {
        repo_path(&self.settings.repos_dir, repo)
    }

    async fn on_completed(&self, job: &repo_job::Model, index: Option<IndexOutcome>) {
        let applied = self
            .lifecycle("on_completed", async {
                match (job.job_type, index) {
                    (RepoJobType::Index, Some(outcome)) => {
                        self.jobs.complete_index(job.id, job.repo_id, &outcome).await
                    }
                    _ => self.jobs.complete_cleanup(job.id, job.repo_id).await,
                }
            })
            .await;
        if applied == Some(false) {
            debug!("Job already reached a terminal state, completion ignored");
        }
    }

    async fn on_failed(&self, job: &repo_job::Model, message: &str) {
        warn!(error = message, "Repo job failed");
        let applied = self
            .lifecycle("on_failed", self.jobs.fail(job.id, message))
            .await;
        if applied == Some(false) {
            debug!("Job already reached a terminal state, failure ignored");
        }
    }

    /// Await a lifecycle transition, reporting instead of propagating its error.
    async fn lifecycle<F, T>(&self, name: &'static str, transition: F) -> Option<T>
    where
        F: Future<Output = Result<T, DbErr>>,
    {
        match transition.await {
            Ok(value) => Some(value),
            Err(err) => {
                error!(handler = name, error = %err, "Repo job lifecycle handler failed");
                self.reporter.report(name, &err);
                None
            }
        }
    }
}

/// Local path of a repo: the path of a `file://` clone URL, else `repos_dir/{id}`.
pub fn repo_path(repos_dir: &Path, repo: &repo::Model) -> RepoPath {
    if let Ok(url) = Url::parse(&repo.clone_url) {
        if url.scheme() == "file" {
            if let Ok(path) = url.to_file_path() {
                return RepoPath {
                    path,
                    read_only: true,
                };
            }
        }
    }
    RepoPath {
        path: repos_dir.join(repo.id.to_string()),
        read_only: false,
    }
}

fn revision_globs(patterns: Option<&[String]>) -> Option<GlobSet> {
    let patterns = patterns?;
    match GlobSet::new(patterns) {
        Ok(globs) => Some(globs),
        Err(err) => {
            warn!(error = %err, "Ignoring invalid revision globs");
            None
        }
    }
}

/// Delete every file in `index_dir` whose name starts with `prefix`.
async fn delete_shards(index_dir: &Path, prefix: &str) -> Result<usize, JobError> {
    let mut entries = match tokio::fs::read_dir(index_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        info!(file = %entry.path().display(), "Deleting shard file");
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(removed)
}
