//! INDEX job execution against in-memory git and indexer doubles.

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use repo_sync::git::{GitRef, RefKind};
use repo_sync::job_worker::{JobOutcome, JobWorker, SHUTDOWN_MESSAGE};
use repo_sync::models::repo::{self, RepoMetadata};
use repo_sync::models::repo_job::{self, RepoJobStatus, RepoJobType};
use repo_sync::models::Repo;
use repo_sync::repositories::RepoJobRepository;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use test_utils::{
    FAKE_HEAD, FakeGit, FakeIndexer, insert_repo, job_worker, setup_test_db_arc, worker_settings,
};
use uuid::Uuid;

async fn set_metadata(db: &DatabaseConnection, repo: repo::Model, metadata: RepoMetadata) -> repo::Model {
    let mut active: repo::ActiveModel = repo.into();
    active.metadata = Set(metadata.to_json());
    active.update(db).await.unwrap()
}

async fn claimed_index_job(db: &Arc<DatabaseConnection>, repo_id: Uuid) -> repo_job::Model {
    let jobs = RepoJobRepository::new(db.clone());
    let job = jobs.create(RepoJobType::Index, repo_id).await.unwrap().unwrap();
    jobs.claim(job.id).await.unwrap().unwrap()
}

async fn job_status(db: &DatabaseConnection, id: Uuid) -> repo_job::Model {
    repo_job::Entity::find_by_id(id).one(db).await.unwrap().unwrap()
}

fn branch(name: &str) -> GitRef {
    GitRef {
        name: name.to_string(),
        kind: RefKind::Branch,
    }
}

fn tag(name: &str) -> GitRef {
    GitRef {
        name: name.to_string(),
        kind: RefKind::Tag,
    }
}

#[tokio::test]
async fn index_job_clones_then_fetches_on_the_next_run() {
    let root = TempDir::new().unwrap();
    let db = setup_test_db_arc().await.unwrap();
    let repo = insert_repo(&db, "api", "https://git.example.com/acme/api", None)
        .await
        .unwrap();
    let mut metadata = RepoMetadata::default();
    metadata
        .git_config
        .insert("zoekt.name".to_string(), "git.example.com/acme/api".to_string());
    let repo = set_metadata(&db, repo, metadata).await;

    let settings = worker_settings(root.path());
    let git = Arc::new(FakeGit::default());
    let indexer = Arc::new(FakeIndexer::new(settings.index_dir.clone()));
    let worker = job_worker(db.clone(), git.clone(), indexer.clone(), settings.clone());

    RepoJobRepository::new(db.clone())
        .create(RepoJobType::Index, repo.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(JobWorker::run_pending(&worker).await.unwrap(), 1);

    assert_eq!(
        git.calls(),
        vec![
            "clone https://git.example.com/acme/api".to_string(),
            "config zoekt.name".to_string(),
        ]
    );
    assert_eq!(git.auth_headers.lock().unwrap().as_slice(), &[None]);
    let requests = indexer.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].repo_path, settings.repos_dir.join(repo.id.to_string()));
    assert_eq!(requests[0].revisions, vec!["HEAD".to_string()]);

    let indexed = Repo::find_by_id(repo.id).one(db.as_ref()).await.unwrap().unwrap();
    assert!(indexed.indexed_at.is_some());
    assert_eq!(indexed.indexed_commit_hash.as_deref(), Some(FAKE_HEAD));
    assert_eq!(
        RepoMetadata::from_json(&indexed.metadata).indexed_revisions,
        Some(vec!["HEAD".to_string()])
    );

    RepoJobRepository::new(db.clone())
        .create(RepoJobType::Index, repo.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(JobWorker::run_pending(&worker).await.unwrap(), 1);

    assert_eq!(
        &git.calls()[2..],
        &[
            "unset remote.origin.url".to_string(),
            "fetch https://git.example.com/acme/api".to_string(),
            "config zoekt.name".to_string(),
        ]
    );
    assert_eq!(indexer.requests().len(), 2);
}

#[tokio::test]
async fn invalid_working_copy_is_deleted_and_recloned() {
    let root = TempDir::new().unwrap();
    let db = setup_test_db_arc().await.unwrap();
    let repo = insert_repo(&db, "broken", "https://git.example.com/acme/broken", None)
        .await
        .unwrap();

    let settings = worker_settings(root.path());
    let path = settings.repos_dir.join(repo.id.to_string());
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("leftover"), b"partial clone").unwrap();

    let git = Arc::new(FakeGit::default());
    let indexer = Arc::new(FakeIndexer::new(settings.index_dir.clone()));
    let worker = job_worker(db.clone(), git.clone(), indexer, settings);

    let job = claimed_index_job(&db, repo.id).await;
    assert_eq!(worker.execute(job, CancellationToken::new()).await, JobOutcome::Completed);

    assert_eq!(git.calls(), vec!["clone https://git.example.com/acme/broken".to_string()]);
    assert!(!path.join("leftover").exists());
    assert!(path.join("HEAD").is_file());
}

#[tokio::test]
async fn revision_globs_select_branches_and_tags() {
    let root = TempDir::new().unwrap();
    let db = setup_test_db_arc().await.unwrap();
    let repo = insert_repo(&db, "web", "https://git.example.com/acme/web", None)
        .await
        .unwrap();
    let repo = set_metadata(
        &db,
        repo,
        RepoMetadata {
            branches: Some(vec!["main".to_string(), "release/*".to_string()]),
            tags: Some(vec!["v1.*".to_string()]),
            ..RepoMetadata::default()
        },
    )
    .await;

    let settings = worker_settings(root.path());
    let git = Arc::new(FakeGit::with_refs(vec![
        branch("main"),
        branch("feature/login"),
        branch("release/1.0"),
        tag("v1.2.0"),
        tag("v2.0.0"),
    ]));
    let indexer = Arc::new(FakeIndexer::new(settings.index_dir.clone()));
    let worker = job_worker(db.clone(), git, indexer.clone(), settings);

    let job = claimed_index_job(&db, repo.id).await;
    assert_eq!(worker.execute(job, CancellationToken::new()).await, JobOutcome::Completed);

    assert_eq!(
        indexer.requests()[0].revisions,
        vec![
            "HEAD".to_string(),
            "refs/heads/main".to_string(),
            "refs/heads/release/1.0".to_string(),
            "refs/tags/v1.2.0".to_string(),
        ]
    );
}

#[tokio::test]
async fn revisions_are_truncated_to_the_limit() {
    let root = TempDir::new().unwrap();
    let db = setup_test_db_arc().await.unwrap();
    let repo = insert_repo(&db, "mono", "https://git.example.com/acme/mono", None)
        .await
        .unwrap();
    let repo = set_metadata(
        &db,
        repo,
        RepoMetadata {
            branches: Some(vec!["**".to_string()]),
            ..RepoMetadata::default()
        },
    )
    .await;

    let mut settings = worker_settings(root.path());
    settings.max_revisions = 3;
    let refs = (0..10).map(|i| branch(&format!("branch-{i}"))).collect();
    let git = Arc::new(FakeGit::with_refs(refs));
    let indexer = Arc::new(FakeIndexer::new(settings.index_dir.clone()));
    let worker = job_worker(db.clone(), git, indexer.clone(), settings);

    let job = claimed_index_job(&db, repo.id).await;
    assert_eq!(worker.execute(job, CancellationToken::new()).await, JobOutcome::Completed);

    let revisions = &indexer.requests()[0].revisions;
    assert_eq!(revisions.len(), 3);
    assert_eq!(revisions[0], "HEAD");
}

#[cfg(unix)]
#[tokio::test]
async fn local_file_repos_are_indexed_in_place() {
    let root = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    std::fs::write(local.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();
    let clone_url = format!("file://{}", local.path().display());

    let db = setup_test_db_arc().await.unwrap();
    let repo = insert_repo(&db, "local", &clone_url, None).await.unwrap();

    let settings = worker_settings(root.path());
    let git = Arc::new(FakeGit::default());
    let indexer = Arc::new(FakeIndexer::new(settings.index_dir.clone()));
    let worker = job_worker(db.clone(), git.clone(), indexer.clone(), settings.clone());

    let job = claimed_index_job(&db, repo.id).await;
    assert_eq!(worker.execute(job, CancellationToken::new()).await, JobOutcome::Completed);

    assert!(git.calls().is_empty());
    assert_eq!(indexer.requests()[0].repo_path, local.path());
    assert!(!settings.repos_dir.join(repo.id.to_string()).exists());
}

#[tokio::test]
async fn clone_failure_fails_the_job_and_leaves_the_repo_unindexed() {
    let root = TempDir::new().unwrap();
    let db = setup_test_db_arc().await.unwrap();
    let repo = insert_repo(&db, "gone", "https://git.example.com/acme/gone", None)
        .await
        .unwrap();

    let settings = worker_settings(root.path());
    let indexer = Arc::new(FakeIndexer::new(settings.index_dir.clone()));
    let worker = job_worker(db.clone(), Arc::new(FakeGit::failing()), indexer.clone(), settings);

    let job = claimed_index_job(&db, repo.id).await;
    let outcome = worker.execute(job.clone(), CancellationToken::new()).await;
    assert!(matches!(outcome, JobOutcome::Failed(ref message) if message.contains("repository not found")));

    let failed = job_status(&db, job.id).await;
    assert_eq!(failed.status, RepoJobStatus::Failed);
    assert!(failed.completed_at.is_some());
    assert!(failed
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("repository not found")));

    assert!(indexer.requests().is_empty());
    let unchanged = Repo::find_by_id(repo.id).one(db.as_ref()).await.unwrap().unwrap();
    assert!(unchanged.indexed_at.is_none());
}

#[tokio::test]
async fn job_past_its_timeout_is_failed_as_stalled() {
    let root = TempDir::new().unwrap();
    let db = setup_test_db_arc().await.unwrap();
    let repo = insert_repo(&db, "huge", "https://git.example.com/acme/huge", None)
        .await
        .unwrap();

    let mut settings = worker_settings(root.path());
    settings.job_timeout = Duration::from_millis(200);
    let indexer = Arc::new(FakeIndexer::slow(settings.index_dir.clone(), Duration::from_secs(30)));
    let worker = job_worker(db.clone(), Arc::new(FakeGit::default()), indexer, settings);

    let job = claimed_index_job(&db, repo.id).await;
    assert_eq!(worker.execute(job.clone(), CancellationToken::new()).await, JobOutcome::Stalled);

    let stalled = job_status(&db, job.id).await;
    assert_eq!(stalled.status, RepoJobStatus::Failed);
    assert_eq!(stalled.error_message.as_deref(), Some("stalled"));
}

#[tokio::test]
async fn shutdown_interrupts_running_jobs_after_the_grace_period() {
    let root = TempDir::new().unwrap();
    let db = setup_test_db_arc().await.unwrap();
    let repo = insert_repo(&db, "busy", "https://git.example.com/acme/busy", None)
        .await
        .unwrap();

    let settings = worker_settings(root.path());
    let indexer = Arc::new(FakeIndexer::slow(settings.index_dir.clone(), Duration::from_secs(30)));
    let worker = job_worker(db.clone(), Arc::new(FakeGit::default()), indexer, settings);

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let job = claimed_index_job(&db, repo.id).await;
    assert_eq!(worker.execute(job.clone(), shutdown).await, JobOutcome::Interrupted);

    let interrupted = job_status(&db, job.id).await;
    assert_eq!(interrupted.status, RepoJobStatus::Failed);
    assert_eq!(interrupted.error_message.as_deref(), Some(SHUTDOWN_MESSAGE));

    // The repo is free for a new job once the interrupted one is terminal.
    assert!(RepoJobRepository::new(db.clone())
        .create(RepoJobType::Index, repo.id)
        .await
        .unwrap()
        .is_some());
}
