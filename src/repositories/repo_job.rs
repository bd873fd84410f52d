//! # RepoJob Repository
//!
//! The repo_jobs table is the durable index/cleanup queue. Every transition is
//! a status-guarded UPDATE, so redelivered or late lifecycle events are no-ops
//! once a job has reached a terminal state.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::db::{db_now, to_db_time};
use crate::error::is_unique_violation;
use crate::models::repo::{self, Entity as Repo, RepoMetadata};
use crate::models::repo_job::{self, Column, Entity as RepoJob, RepoJobStatus, RepoJobType};

/// Error message recorded on jobs that exceeded their timeout.
pub const STALLED_MESSAGE: &str = "stalled";

/// Result of a successful INDEX run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    pub commit_hash: Option<String>,
    pub revisions: Vec<String>,
}

/// Repository for repo job database operations
#[derive(Debug, Clone)]
pub struct RepoJobRepository {
    db: Arc<DatabaseConnection>,
}

impl RepoJobRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<repo_job::Model>, DbErr> {
        RepoJob::find_by_id(id).one(self.db.as_ref()).await
    }

    /// Job history of a repo, newest first.
    pub async fn list_for_repo(
        &self,
        repo_id: Uuid,
        limit: u64,
    ) -> Result<Vec<repo_job::Model>, DbErr> {
        RepoJob::find()
            .filter(Column::RepoId.eq(repo_id))
            .order_by_desc(Column::CreatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await
    }

    /// Insert a PENDING job. Returns `None` when the repo already has an
    /// active job and the per-repo unique index rejected the row.
    pub async fn create(
        &self,
        job_type: RepoJobType,
        repo_id: Uuid,
    ) -> Result<Option<repo_job::Model>, DbErr> {
        let job = repo_job::ActiveModel {
            id: Set(Uuid::new_v4()),
            job_type: Set(job_type),
            status: Set(RepoJobStatus::Pending),
            repo_id: Set(repo_id),
            metadata: Set(None),
            error_message: Set(None),
            created_at: Set(db_now()),
            started_at: Set(None),
            completed_at: Set(None),
        };

        match job.insert(self.db.as_ref()).await {
            Ok(model) => Ok(Some(model)),
            Err(err) if is_unique_violation(&err) => {
                debug!(repo_id = %repo_id, ?job_type, "Repo already has an active job");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Oldest PENDING job ids, for dispatch.
    pub async fn pending_ids(&self, limit: u64) -> Result<Vec<Uuid>, DbErr> {
        RepoJob::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.eq(RepoJobStatus::Pending))
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .into_tuple()
            .all(self.db.as_ref())
            .await
    }

    /// `PENDING -> IN_PROGRESS`; `None` when another worker claimed it first
    /// or the job is no longer pending.
    pub async fn claim(&self, id: Uuid) -> Result<Option<repo_job::Model>, DbErr> {
        let result = RepoJob::update_many()
            .col_expr(Column::Status, Expr::value(RepoJobStatus::InProgress))
            .col_expr(Column::StartedAt, Expr::value(Some(db_now())))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(RepoJobStatus::Pending))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.get_by_id(id).await
    }

    /// Complete an INDEX job and record the indexed state on its repo.
    pub async fn complete_index(
        &self,
        job_id: Uuid,
        repo_id: Uuid,
        outcome: &IndexOutcome,
    ) -> Result<bool, DbErr> {
        let txn = self.db.begin().await?;
        let now = db_now();

        let job_metadata = json!({
            "indexedCommitHash": outcome.commit_hash,
            "indexedRevisions": outcome.revisions,
        });
        let applied = RepoJob::update_many()
            .col_expr(Column::Status, Expr::value(RepoJobStatus::Completed))
            .col_expr(Column::CompletedAt, Expr::value(Some(now)))
            .col_expr(Column::Metadata, Expr::value(Some(job_metadata)))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(RepoJobStatus::InProgress))
            .exec(&txn)
            .await?
            .rows_affected
            > 0;

        if applied {
            if let Some(model) = Repo::find_by_id(repo_id).one(&txn).await? {
                let mut metadata = RepoMetadata::from_json(&model.metadata);
                metadata.indexed_revisions = Some(outcome.revisions.clone());

                let mut active: repo::ActiveModel = model.into();
                active.indexed_at = Set(Some(now));
                active.indexed_commit_hash = Set(outcome.commit_hash.clone());
                active.metadata = Set(metadata.to_json());
                active.updated_at = Set(now);
                active.update(&txn).await?;
            }
        }

        txn.commit().await?;
        Ok(applied)
    }

    /// Complete a CLEANUP job and remove its repo from the catalog.
    pub async fn complete_cleanup(&self, job_id: Uuid, repo_id: Uuid) -> Result<bool, DbErr> {
        let txn = self.db.begin().await?;

        let applied = RepoJob::update_many()
            .col_expr(Column::Status, Expr::value(RepoJobStatus::Completed))
            .col_expr(Column::CompletedAt, Expr::value(Some(db_now())))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(RepoJobStatus::InProgress))
            .exec(&txn)
            .await?
            .rows_affected
            > 0;

        if applied {
            Repo::delete_by_id(repo_id).exec(&txn).await?;
        }

        txn.commit().await?;
        Ok(applied)
    }

    /// Mark an active job FAILED with `message`.
    pub async fn fail(&self, job_id: Uuid, message: &str) -> Result<bool, DbErr> {
        let result = RepoJob::update_many()
            .col_expr(Column::Status, Expr::value(RepoJobStatus::Failed))
            .col_expr(Column::CompletedAt, Expr::value(Some(db_now())))
            .col_expr(Column::ErrorMessage, Expr::value(Some(message.to_string())))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(RepoJobStatus::ACTIVE))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Fail IN_PROGRESS jobs that started before `started_before` as stalled,
    /// completing them at `failed_at`.
    pub async fn fail_stalled(
        &self,
        started_before: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    ) -> Result<u64, DbErr> {
        let result = RepoJob::update_many()
            .col_expr(Column::Status, Expr::value(RepoJobStatus::Failed))
            .col_expr(Column::CompletedAt, Expr::value(Some(to_db_time(failed_at))))
            .col_expr(
                Column::ErrorMessage,
                Expr::value(Some(STALLED_MESSAGE.to_string())),
            )
            .filter(Column::Status.eq(RepoJobStatus::InProgress))
            .filter(Column::StartedAt.lt(to_db_time(started_before)))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn setup() -> (Arc<DatabaseConnection>, RepoJobRepository) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let db = Arc::new(db);
        (db.clone(), RepoJobRepository::new(db))
    }

    async fn insert_repo(db: &DatabaseConnection) -> Uuid {
        let now = db_now();
        let model = repo::ActiveModel {
            id: Set(Uuid::new_v4()),
            org_id: Set(1),
            name: Set("github.com/acme/api".to_string()),
            clone_url: Set("https://github.com/acme/api.git".to_string()),
            web_url: Set(None),
            image_url: Set(None),
            is_fork: Set(false),
            is_archived: Set(false),
            metadata: Set(json!({ "branches": ["main"] })),
            external_id: Set("1".to_string()),
            external_code_host_type: Set("github".to_string()),
            external_code_host_url: Set("https://github.com".to_string()),
            indexed_at: Set(None),
            indexed_commit_hash: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap();
        model.id
    }

    #[tokio::test]
    async fn only_one_active_job_per_repo() {
        let (db, jobs) = setup().await;
        let repo_id = insert_repo(&db).await;

        let first = jobs.create(RepoJobType::Index, repo_id).await.unwrap();
        assert!(first.is_some());
        assert!(
            jobs.create(RepoJobType::Cleanup, repo_id)
                .await
                .unwrap()
                .is_none()
        );

        let first = first.unwrap();
        jobs.claim(first.id).await.unwrap().unwrap();
        jobs.fail(first.id, "boom").await.unwrap();

        assert!(
            jobs.create(RepoJobType::Index, repo_id)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let (db, jobs) = setup().await;
        let repo_id = insert_repo(&db).await;
        let job = jobs
            .create(RepoJobType::Index, repo_id)
            .await
            .unwrap()
            .unwrap();

        let claimed = jobs.claim(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, RepoJobStatus::InProgress);
        assert!(claimed.started_at.is_some());
        assert!(jobs.claim(job.id).await.unwrap().is_none());
        assert!(jobs.pending_ids(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_index_updates_repo_once() {
        let (db, jobs) = setup().await;
        let repo_id = insert_repo(&db).await;
        let job = jobs
            .create(RepoJobType::Index, repo_id)
            .await
            .unwrap()
            .unwrap();
        jobs.claim(job.id).await.unwrap();

        let outcome = IndexOutcome {
            commit_hash: Some("abc123".to_string()),
            revisions: vec!["HEAD".to_string(), "refs/heads/main".to_string()],
        };
        assert!(jobs.complete_index(job.id, repo_id, &outcome).await.unwrap());
        assert!(!jobs.complete_index(job.id, repo_id, &outcome).await.unwrap());
        assert!(!jobs.fail(job.id, "late failure").await.unwrap());

        let repo = Repo::find_by_id(repo_id).one(db.as_ref()).await.unwrap().unwrap();
        assert!(repo.indexed_at.is_some());
        assert_eq!(repo.indexed_commit_hash.as_deref(), Some("abc123"));
        let metadata = RepoMetadata::from_json(&repo.metadata);
        assert_eq!(metadata.indexed_revisions, Some(outcome.revisions));
        assert_eq!(metadata.branches, Some(vec!["main".to_string()]));

        let job = jobs.get_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, RepoJobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn complete_cleanup_deletes_repo() {
        let (db, jobs) = setup().await;
        let repo_id = insert_repo(&db).await;
        let job = jobs
            .create(RepoJobType::Cleanup, repo_id)
            .await
            .unwrap()
            .unwrap();
        jobs.claim(job.id).await.unwrap();

        assert!(jobs.complete_cleanup(job.id, repo_id).await.unwrap());
        assert!(
            Repo::find_by_id(repo_id)
                .one(db.as_ref())
                .await
                .unwrap()
                .is_none()
        );
        // Job history outlives the repo.
        assert_eq!(jobs.list_for_repo(repo_id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_jobs_fail() {
        let (db, jobs) = setup().await;
        let repo_id = insert_repo(&db).await;
        let job = jobs
            .create(RepoJobType::Index, repo_id)
            .await
            .unwrap()
            .unwrap();
        jobs.claim(job.id).await.unwrap();

        let now = Utc::now();
        assert_eq!(
            jobs.fail_stalled(now - Duration::hours(1), now)
                .await
                .unwrap(),
            0
        );
        let failed_at = now + Duration::hours(2);
        assert_eq!(
            jobs.fail_stalled(now + Duration::seconds(1), failed_at)
                .await
                .unwrap(),
            1
        );

        let job = jobs.get_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, RepoJobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(STALLED_MESSAGE));
        let completed_at = job.completed_at.unwrap().with_timezone(&Utc);
        assert!((completed_at - failed_at).num_seconds().abs() < 1);
    }
}
