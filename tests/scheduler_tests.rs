//! Index scheduling windows and the orphan cleanup lifecycle, end to end over
//! the scheduler, the job worker and in-memory git/indexer doubles.

mod test_utils;

use std::sync::Arc;

use chrono::{Duration, Utc};
use repo_sync::config::IndexingConfig;
use repo_sync::indexer::shard_prefix;
use repo_sync::job_worker::JobWorker;
use repo_sync::models::repo_job::{self, RepoJobStatus, RepoJobType};
use repo_sync::models::{Repo, RepoJob};
use repo_sync::repositories::{ConnectionRepository, RepoJobRepository};
use repo_sync::scheduler::IndexJobScheduler;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;
use test_utils::{
    FakeGit, FakeIndexer, insert_repo, job_worker, link_repo, setup_test_db_arc, worker_settings,
};

const DAY: i64 = 24 * 3600;

fn indexing(reindex_days: i64, grace_days: i64) -> IndexingConfig {
    IndexingConfig {
        reindex_interval_seconds: (reindex_days * DAY) as u64,
        gc_grace_period_seconds: (grace_days * DAY) as u64,
        ..IndexingConfig::default()
    }
}

#[tokio::test]
async fn repos_past_the_reindex_interval_get_index_jobs() {
    let db = setup_test_db_arc().await.unwrap();
    let connection = ConnectionRepository::new(db.clone())
        .create(1, "acme", "git", json!({ "url": "https://git.example.com/acme/api" }))
        .await
        .unwrap();

    let now = Utc::now();
    let stale = insert_repo(&db, "stale", "https://git.example.com/stale", Some(now - Duration::days(10)))
        .await
        .unwrap();
    let fresh = insert_repo(&db, "fresh", "https://git.example.com/fresh", Some(now - Duration::days(1)))
        .await
        .unwrap();
    let never = insert_repo(&db, "never", "https://git.example.com/never", None)
        .await
        .unwrap();
    for repo in [&stale, &fresh, &never] {
        link_repo(&db, repo.id, connection.id).await.unwrap();
    }

    let notify = Arc::new(Notify::new());
    let scheduler = IndexJobScheduler::new(db.clone(), indexing(7, 14), notify.clone());
    scheduler.tick(now).await.unwrap();

    let jobs = RepoJob::find().all(db.as_ref()).await.unwrap();
    let mut scheduled: Vec<_> = jobs.iter().map(|job| job.repo_id).collect();
    scheduled.sort();
    let mut expected = vec![stale.id, never.id];
    expected.sort();
    assert_eq!(scheduled, expected);
    assert!(jobs.iter().all(|job| job.job_type == RepoJobType::Index));
    assert!(jobs.iter().all(|job| job.status == RepoJobStatus::Pending));

    // The worker was woken for the committed jobs.
    tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
        .await
        .expect("scheduler notifies the worker");

    // A second pass while the jobs are pending schedules nothing new.
    scheduler.tick(now).await.unwrap();
    assert_eq!(RepoJob::find().all(db.as_ref()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn recently_failed_index_job_blocks_rescheduling_until_the_window_passes() {
    let db = setup_test_db_arc().await.unwrap();
    let repo = insert_repo(&db, "flaky", "https://git.example.com/flaky", None)
        .await
        .unwrap();
    let connection = ConnectionRepository::new(db.clone())
        .create(1, "acme", "git", json!({ "url": "https://git.example.com/flaky" }))
        .await
        .unwrap();
    link_repo(&db, repo.id, connection.id).await.unwrap();

    let jobs = RepoJobRepository::new(db.clone());
    let job = jobs.create(RepoJobType::Index, repo.id).await.unwrap().unwrap();
    jobs.claim(job.id).await.unwrap().unwrap();
    assert!(jobs.fail(job.id, "clone failed").await.unwrap());

    let scheduler = IndexJobScheduler::new(db.clone(), indexing(7, 14), Arc::new(Notify::new()));
    let now = Utc::now();
    assert!(scheduler.schedule_index_jobs(now).await.unwrap().is_empty());

    let later = now + Duration::days(8);
    let created = scheduler.schedule_index_jobs(later).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].repo_id, repo.id);
}

#[tokio::test]
async fn orphaned_repo_is_cleaned_up_after_the_grace_period() {
    let root = TempDir::new().unwrap();
    let db = setup_test_db_arc().await.unwrap();
    let now = Utc::now();

    let orphan = insert_repo(&db, "orphan", "https://git.example.com/orphan", Some(now - Duration::days(30)))
        .await
        .unwrap();
    let recent_orphan = insert_repo(&db, "recent", "https://git.example.com/recent", Some(now - Duration::days(3)))
        .await
        .unwrap();
    let linked = insert_repo(&db, "linked", "https://git.example.com/linked", Some(now - Duration::days(30)))
        .await
        .unwrap();
    let connection = ConnectionRepository::new(db.clone())
        .create(1, "acme", "git", json!({ "url": "https://git.example.com/linked" }))
        .await
        .unwrap();
    link_repo(&db, linked.id, connection.id).await.unwrap();

    // Working copy and shards left behind by earlier INDEX runs.
    let settings = worker_settings(root.path());
    let orphan_dir = settings.repos_dir.join(orphan.id.to_string());
    std::fs::create_dir_all(&orphan_dir).unwrap();
    std::fs::write(orphan_dir.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    std::fs::create_dir_all(&settings.index_dir).unwrap();
    let orphan_shard = settings
        .index_dir
        .join(format!("{}_v16.00000.zoekt", shard_prefix(1, orphan.id)));
    let linked_shard = settings
        .index_dir
        .join(format!("{}_v16.00000.zoekt", shard_prefix(1, linked.id)));
    std::fs::write(&orphan_shard, b"").unwrap();
    std::fs::write(&linked_shard, b"").unwrap();

    let scheduler = IndexJobScheduler::new(db.clone(), indexing(60, 14), Arc::new(Notify::new()));
    scheduler.tick(now).await.unwrap();

    let cleanup_jobs = RepoJob::find()
        .filter(repo_job::Column::JobType.eq(RepoJobType::Cleanup))
        .all(db.as_ref())
        .await
        .unwrap();
    assert_eq!(cleanup_jobs.len(), 1);
    assert_eq!(cleanup_jobs[0].repo_id, orphan.id);
    assert!(RepoJob::find()
        .filter(repo_job::Column::RepoId.is_in([recent_orphan.id, linked.id]))
        .all(db.as_ref())
        .await
        .unwrap()
        .is_empty());

    let git = Arc::new(FakeGit::default());
    let indexer = Arc::new(FakeIndexer::new(settings.index_dir.clone()));
    let worker = job_worker(db.clone(), git.clone(), indexer.clone(), settings);
    assert_eq!(JobWorker::run_pending(&worker).await.unwrap(), 1);

    assert!(!orphan_dir.exists());
    assert!(!orphan_shard.exists());
    assert!(linked_shard.exists());
    assert!(git.calls().is_empty());
    assert!(indexer.requests().is_empty());

    assert!(Repo::find_by_id(orphan.id).one(db.as_ref()).await.unwrap().is_none());
    assert!(Repo::find_by_id(recent_orphan.id).one(db.as_ref()).await.unwrap().is_some());
    let job = RepoJob::find_by_id(cleanup_jobs[0].id)
        .one(db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, RepoJobStatus::Completed);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn stalled_jobs_are_failed_and_rescheduled() {
    let db = setup_test_db_arc().await.unwrap();
    let repo = insert_repo(&db, "slow", "https://git.example.com/slow", None)
        .await
        .unwrap();
    let connection = ConnectionRepository::new(db.clone())
        .create(1, "acme", "git", json!({ "url": "https://git.example.com/slow" }))
        .await
        .unwrap();
    link_repo(&db, repo.id, connection.id).await.unwrap();

    let jobs = RepoJobRepository::new(db.clone());
    let job = jobs.create(RepoJobType::Index, repo.id).await.unwrap().unwrap();
    jobs.claim(job.id).await.unwrap().unwrap();

    let config = IndexingConfig {
        job_timeout_seconds: 3600,
        reindex_interval_seconds: 60,
        ..IndexingConfig::default()
    };
    let scheduler = IndexJobScheduler::new(db.clone(), config, Arc::new(Notify::new()));

    // Seven hours later the IN_PROGRESS job is past the one hour timeout.
    let later = Utc::now() + Duration::hours(7);
    assert_eq!(scheduler.sweep_stalled(later).await.unwrap(), 1);

    let stalled = jobs.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stalled.status, RepoJobStatus::Failed);
    assert_eq!(stalled.error_message.as_deref(), Some("stalled"));
    // Completion is stamped with the sweep's clock, not the wall clock.
    let completed_at = stalled.completed_at.unwrap().with_timezone(&Utc);
    assert!(completed_at > Utc::now() + Duration::hours(6));

    // The failure is older than the reindex window at `later`, so a fresh job is created.
    let created = scheduler.schedule_index_jobs(later).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_ne!(created[0].id, job.id);
}
