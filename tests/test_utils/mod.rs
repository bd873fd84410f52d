//! Test utilities for database testing.
//!
//! This module provides utilities for setting up in-memory SQLite databases
//! with migrations, fixture rows for the catalog tables, and in-memory git
//! and indexer doubles for the job worker.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use repo_sync::connectors::TokenResolver;
use repo_sync::db::{db_now, to_db_time};
use repo_sync::error::JobError;
use repo_sync::git::{Git, GitRef, ProgressFn};
use repo_sync::indexer::{IndexRequest, Indexer};
use repo_sync::job_worker::{JobWorker, JobWorkerSettings};
use repo_sync::models::{repo, repo_to_connection};
use repo_sync::telemetry::LoggingErrorReporter;
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, Set};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Same as [`setup_test_db`], wrapped for the repositories and services.
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

/// Inserts a repo row directly, bypassing discovery.
pub async fn insert_repo(
    db: &DatabaseConnection,
    name: &str,
    clone_url: &str,
    indexed_at: Option<DateTime<Utc>>,
) -> Result<repo::Model> {
    let now = db_now();
    let model = repo::ActiveModel {
        id: Set(Uuid::new_v4()),
        org_id: Set(1),
        name: Set(name.to_string()),
        clone_url: Set(clone_url.to_string()),
        web_url: Set(None),
        image_url: Set(None),
        is_fork: Set(false),
        is_archived: Set(false),
        metadata: Set(json!({})),
        external_id: Set(name.to_string()),
        external_code_host_type: Set("git".to_string()),
        external_code_host_url: Set("https://git.example.com".to_string()),
        indexed_at: Set(indexed_at.map(to_db_time)),
        indexed_commit_hash: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;
    Ok(model)
}

/// Links a repo to a connection.
pub async fn link_repo(
    db: &DatabaseConnection,
    repo_id: Uuid,
    connection_id: Uuid,
) -> Result<()> {
    repo_to_connection::ActiveModel {
        repo_id: Set(repo_id),
        connection_id: Set(connection_id),
        added_at: Set(db_now()),
    }
    .insert(db)
    .await?;
    Ok(())
}

/// In-memory [`Git`]: a clone is a directory holding a `HEAD` file.
#[derive(Default)]
pub struct FakeGit {
    pub calls: Mutex<Vec<String>>,
    pub refs: Vec<GitRef>,
    pub fail_clone: bool,
    pub auth_headers: Mutex<Vec<Option<String>>>,
}

impl FakeGit {
    pub fn with_refs(refs: Vec<GitRef>) -> Self {
        Self {
            refs,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_clone: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Git for FakeGit {
    async fn clone_repo(
        &self,
        url: &str,
        auth_header: Option<&str>,
        dest: &Path,
        on_progress: &ProgressFn,
    ) -> Result<(), JobError> {
        self.record(format!("clone {url}"));
        self.auth_headers
            .lock()
            .unwrap()
            .push(auth_header.map(str::to_string));
        if self.fail_clone {
            return Err(JobError::Git("fatal: repository not found".to_string()));
        }
        on_progress("Receiving objects: 100% (3/3), done.");
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("HEAD"), "ref: refs/heads/main\n")?;
        Ok(())
    }

    async fn fetch(
        &self,
        url: &str,
        auth_header: Option<&str>,
        _path: &Path,
        _on_progress: &ProgressFn,
    ) -> Result<(), JobError> {
        self.record(format!("fetch {url}"));
        self.auth_headers
            .lock()
            .unwrap()
            .push(auth_header.map(str::to_string));
        Ok(())
    }

    async fn is_valid_git_repo_root(&self, path: &Path) -> bool {
        path.join("HEAD").is_file()
    }

    async fn unset_git_config(&self, _path: &Path, keys: &[&str]) -> Result<(), JobError> {
        self.record(format!("unset {}", keys.join(",")));
        Ok(())
    }

    async fn upsert_git_config(
        &self,
        _path: &Path,
        config: &BTreeMap<String, String>,
    ) -> Result<(), JobError> {
        let keys: Vec<&str> = config.keys().map(String::as_str).collect();
        self.record(format!("config {}", keys.join(",")));
        Ok(())
    }

    async fn list_refs(&self, _path: &Path) -> Result<Vec<GitRef>, JobError> {
        self.record("list_refs");
        Ok(self.refs.clone())
    }

    async fn head_commit(&self, _path: &Path) -> Result<Option<String>, JobError> {
        Ok(Some(FAKE_HEAD.to_string()))
    }
}

/// Commit every fake clone reports as `HEAD`.
pub const FAKE_HEAD: &str = "0123456789abcdef0123456789abcdef01234567";

/// [`Indexer`] writing one empty shard per request into `index_dir`.
pub struct FakeIndexer {
    pub index_dir: PathBuf,
    pub requests: Mutex<Vec<IndexRequest>>,
    pub delay: Option<Duration>,
}

impl FakeIndexer {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn slow(index_dir: impl Into<PathBuf>, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(index_dir)
        }
    }

    pub fn requests(&self) -> Vec<IndexRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Indexer for FakeIndexer {
    async fn index_repository(&self, request: &IndexRequest) -> Result<(), JobError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        std::fs::create_dir_all(&self.index_dir)?;
        std::fs::write(
            self.index_dir
                .join(format!("{}_v16.00000.zoekt", request.shard_prefix())),
            b"",
        )?;
        Ok(())
    }
}

/// Worker settings rooted in a temp directory, with short timers.
pub fn worker_settings(root: &Path) -> JobWorkerSettings {
    JobWorkerSettings {
        repos_dir: root.join("repos"),
        index_dir: root.join("index"),
        max_concurrency: 4,
        job_timeout: Duration::from_secs(30),
        max_revisions: 64,
        poll_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(50),
    }
}

/// A job worker over the fakes, with no token source.
pub fn job_worker(
    db: Arc<DatabaseConnection>,
    git: Arc<dyn Git>,
    indexer: Arc<dyn Indexer>,
    settings: JobWorkerSettings,
) -> Arc<JobWorker> {
    Arc::new(JobWorker::new(
        db.clone(),
        git,
        indexer,
        TokenResolver::new(db, None),
        Arc::new(LoggingErrorReporter),
        settings,
        Arc::new(Notify::new()),
    ))
}
