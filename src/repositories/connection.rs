//! Connection repository for database operations
//!
//! This module provides the ConnectionRepository struct which encapsulates
//! SeaORM operations for the connections table, including every guarded
//! `sync_status` transition the poller and the sync engine perform.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{db_now, to_db_time};
use crate::models::connection::{self, Column, Entity as Connection, SyncStatus};

/// Default page size for connection listings.
pub const DEFAULT_LIST_LIMIT: u64 = 100;

/// Outcome of a manual sync request.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRequest {
    /// The connection was moved back to `SYNC_NEEDED`
    Flagged(connection::Model),
    /// The connection is queued or syncing already
    AlreadyActive(SyncStatus),
    NotFound,
}

/// Outcome of writing one connection from the connections file.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclarativeUpsert {
    /// Inserted in `SYNC_NEEDED`
    Created(connection::Model),
    /// Config or type differs from the stored row and was replaced
    Changed(connection::Model),
    Unchanged(connection::Model),
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl ConnectionRepository {
    /// Creates a new ConnectionRepository instance
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert a connection in `SYNC_NEEDED` so the next poller tick picks it up.
    pub async fn create(
        &self,
        org_id: i32,
        name: &str,
        connection_type: &str,
        config: JsonValue,
    ) -> Result<connection::Model, DbErr> {
        let now = db_now();
        connection::ActiveModel {
            id: Set(Uuid::new_v4()),
            org_id: Set(org_id),
            name: Set(name.to_string()),
            connection_type: Set(connection_type.to_string()),
            config: Set(config),
            sync_status: Set(SyncStatus::SyncNeeded),
            sync_status_metadata: Set(None),
            is_declarative: Set(false),
            synced_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
    }

    /// Insert or update the declarative connection `name` in `org_id`.
    ///
    /// Existing rows keep their `sync_status`; flagging a changed connection
    /// goes through [`Self::request_sync`].
    pub async fn upsert_declarative(
        &self,
        org_id: i32,
        name: &str,
        connection_type: &str,
        config: JsonValue,
    ) -> Result<DeclarativeUpsert, DbErr> {
        let txn = self.db.begin().await?;
        let existing = Connection::find()
            .filter(Column::OrgId.eq(org_id))
            .filter(Column::Name.eq(name))
            .one(&txn)
            .await?;

        let now = db_now();
        let outcome = match existing {
            None => {
                let model = connection::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    org_id: Set(org_id),
                    name: Set(name.to_string()),
                    connection_type: Set(connection_type.to_string()),
                    config: Set(config),
                    sync_status: Set(SyncStatus::SyncNeeded),
                    sync_status_metadata: Set(None),
                    is_declarative: Set(true),
                    synced_at: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
                DeclarativeUpsert::Created(model)
            }
            Some(model) if model.config == config && model.connection_type == connection_type => {
                if model.is_declarative {
                    DeclarativeUpsert::Unchanged(model)
                } else {
                    let mut active: connection::ActiveModel = model.into();
                    active.is_declarative = Set(true);
                    DeclarativeUpsert::Unchanged(active.update(&txn).await?)
                }
            }
            Some(model) => {
                let mut active: connection::ActiveModel = model.into();
                active.connection_type = Set(connection_type.to_string());
                active.config = Set(config);
                active.is_declarative = Set(true);
                active.updated_at = Set(now);
                DeclarativeUpsert::Changed(active.update(&txn).await?)
            }
        };

        txn.commit().await?;
        Ok(outcome)
    }

    /// Delete declarative connections of `org_id` whose name is not in `keep`.
    /// Their edges cascade, leaving repos no other connection sees orphaned.
    pub async fn delete_declarative_except(
        &self,
        org_id: i32,
        keep: &[String],
    ) -> Result<Vec<connection::Model>, DbErr> {
        let txn = self.db.begin().await?;
        let removed = Connection::find()
            .filter(Column::OrgId.eq(org_id))
            .filter(Column::IsDeclarative.eq(true))
            .filter(Column::Name.is_not_in(keep.iter().cloned()))
            .all(&txn)
            .await?;

        if !removed.is_empty() {
            Connection::delete_many()
                .filter(Column::Id.is_in(removed.iter().map(|model| model.id)))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        Ok(removed)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<connection::Model>, DbErr> {
        Connection::find_by_id(id).one(self.db.as_ref()).await
    }

    /// List connections ordered by creation time.
    pub async fn list(&self, limit: u64, offset: u64) -> Result<Vec<connection::Model>, DbErr> {
        Connection::find()
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(self.db.as_ref())
            .await
    }

    /// Move a terminal connection back to `SYNC_NEEDED`.
    pub async fn request_sync(&self, id: Uuid) -> Result<SyncRequest, DbErr> {
        let result = Connection::update_many()
            .col_expr(Column::SyncStatus, Expr::value(SyncStatus::SyncNeeded))
            .col_expr(Column::UpdatedAt, Expr::value(db_now()))
            .filter(Column::Id.eq(id))
            .filter(Column::SyncStatus.is_in(SyncStatus::TERMINAL))
            .exec(self.db.as_ref())
            .await?;

        let current = self.get_by_id(id).await?;
        Ok(match current {
            None => SyncRequest::NotFound,
            Some(model) if result.rows_affected > 0 => SyncRequest::Flagged(model),
            Some(model) if model.sync_status == SyncStatus::SyncNeeded => {
                SyncRequest::Flagged(model)
            }
            Some(model) => SyncRequest::AlreadyActive(model.sync_status),
        })
    }

    /// Return connections interrupted by a crash or restart to `SYNC_NEEDED`.
    pub async fn reset_interrupted(&self) -> Result<u64, DbErr> {
        let result = Connection::update_many()
            .col_expr(Column::SyncStatus, Expr::value(SyncStatus::SyncNeeded))
            .col_expr(Column::UpdatedAt, Expr::value(db_now()))
            .filter(Column::SyncStatus.is_in([SyncStatus::InSyncQueue, SyncStatus::Syncing]))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    /// Flag terminal connections whose last sync finished before `synced_before`.
    pub async fn flag_for_resync(&self, synced_before: DateTime<Utc>) -> Result<u64, DbErr> {
        let result = Connection::update_many()
            .col_expr(Column::SyncStatus, Expr::value(SyncStatus::SyncNeeded))
            .col_expr(Column::UpdatedAt, Expr::value(db_now()))
            .filter(Column::SyncStatus.is_in(SyncStatus::TERMINAL))
            .filter(
                Condition::any()
                    .add(Column::SyncedAt.is_null())
                    .add(Column::SyncedAt.lt(to_db_time(synced_before))),
            )
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    /// Atomically move up to `limit` connections from `SYNC_NEEDED` to
    /// `IN_SYNC_QUEUE` and return their ids.
    pub async fn claim_for_sync(&self, limit: u64) -> Result<Vec<Uuid>, DbErr> {
        let txn = self.db.begin().await?;

        let candidates: Vec<Uuid> = Connection::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::SyncStatus.eq(SyncStatus::SyncNeeded))
            .order_by_asc(Column::UpdatedAt)
            .limit(limit)
            .into_tuple()
            .all(&txn)
            .await?;

        if candidates.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        Connection::update_many()
            .col_expr(Column::SyncStatus, Expr::value(SyncStatus::InSyncQueue))
            .col_expr(Column::UpdatedAt, Expr::value(db_now()))
            .filter(Column::Id.is_in(candidates.clone()))
            .filter(Column::SyncStatus.eq(SyncStatus::SyncNeeded))
            .exec(&txn)
            .await?;

        let claimed: Vec<Uuid> = Connection::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Id.is_in(candidates))
            .filter(Column::SyncStatus.eq(SyncStatus::InSyncQueue))
            .into_tuple()
            .all(&txn)
            .await?;

        txn.commit().await?;
        Ok(claimed)
    }

    /// `IN_SYNC_QUEUE -> SYNCING`; returns the connection when the transition applied.
    pub async fn mark_syncing(&self, id: Uuid) -> Result<Option<connection::Model>, DbErr> {
        let result = Connection::update_many()
            .col_expr(Column::SyncStatus, Expr::value(SyncStatus::Syncing))
            .col_expr(Column::UpdatedAt, Expr::value(db_now()))
            .filter(Column::Id.eq(id))
            .filter(Column::SyncStatus.eq(SyncStatus::InSyncQueue))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.get_by_id(id).await
    }

    /// Record the outcome of a sync; only applies while the connection is `SYNCING`.
    pub async fn finish_sync(
        &self,
        id: Uuid,
        status: SyncStatus,
        metadata: Option<JsonValue>,
    ) -> Result<bool, DbErr> {
        let now = db_now();
        let result = Connection::update_many()
            .col_expr(Column::SyncStatus, Expr::value(status))
            .col_expr(Column::SyncStatusMetadata, Expr::value(metadata))
            .col_expr(Column::SyncedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::SyncStatus.eq(SyncStatus::Syncing))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use serde_json::json;

    async fn repository() -> ConnectionRepository {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        ConnectionRepository::new(Arc::new(db))
    }

    async fn set_status(repo: &ConnectionRepository, id: Uuid, status: SyncStatus) {
        let model = repo.get_by_id(id).await.unwrap().unwrap();
        let mut active: connection::ActiveModel = model.into();
        active.sync_status = Set(status);
        active.update(repo.db.as_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn declarative_upsert_reports_what_changed() {
        let repo = repository().await;
        let config = json!({ "type": "github", "orgs": ["acme"] });

        let DeclarativeUpsert::Created(created) = repo
            .upsert_declarative(1, "gh", "github", config.clone())
            .await
            .unwrap()
        else {
            panic!("expected a new connection");
        };
        assert!(created.is_declarative);
        assert_eq!(created.sync_status, SyncStatus::SyncNeeded);

        set_status(&repo, created.id, SyncStatus::Synced).await;
        let unchanged = repo
            .upsert_declarative(1, "gh", "github", config)
            .await
            .unwrap();
        assert!(matches!(unchanged, DeclarativeUpsert::Unchanged(ref m) if m.id == created.id));

        let changed = repo
            .upsert_declarative(1, "gh", "github", json!({ "type": "github", "orgs": ["other"] }))
            .await
            .unwrap();
        let DeclarativeUpsert::Changed(changed) = changed else {
            panic!("expected a config change");
        };
        assert_eq!(changed.id, created.id);
        assert_eq!(changed.config["orgs"], json!(["other"]));
        // The status is left for the sync path to move.
        assert_eq!(changed.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn delete_declarative_spares_kept_and_manual_rows() {
        let repo = repository().await;
        repo.upsert_declarative(1, "keep", "git", json!({ "url": "https://a" }))
            .await
            .unwrap();
        repo.upsert_declarative(1, "drop", "git", json!({ "url": "https://b" }))
            .await
            .unwrap();
        repo.upsert_declarative(2, "drop", "git", json!({ "url": "https://c" }))
            .await
            .unwrap();
        let manual = repo
            .create(1, "manual", "git", json!({ "url": "https://d" }))
            .await
            .unwrap();

        let removed = repo
            .delete_declarative_except(1, &["keep".to_string()])
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, "drop");
        assert_eq!(removed[0].org_id, 1);

        let names: Vec<_> = repo
            .list(DEFAULT_LIST_LIMIT, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.org_id, m.name))
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&(1, "keep".to_string())));
        assert!(names.contains(&(2, "drop".to_string())));
        assert!(repo.get_by_id(manual.id).await.unwrap().is_some());

        // An empty file removes every declarative row of the org.
        let removed = repo.delete_declarative_except(1, &[]).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(repo.get_by_id(manual.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_moves_sync_needed_into_queue_once() {
        let repo = repository().await;
        let a = repo
            .create(1, "a", "github", json!({ "orgs": ["acme"] }))
            .await
            .unwrap();
        let b = repo.create(1, "b", "gerrit", json!({})).await.unwrap();
        set_status(&repo, b.id, SyncStatus::Synced).await;

        let claimed = repo.claim_for_sync(10).await.unwrap();
        assert_eq!(claimed, vec![a.id]);
        assert!(repo.claim_for_sync(10).await.unwrap().is_empty());

        let reloaded = repo.get_by_id(a.id).await.unwrap().unwrap();
        assert_eq!(reloaded.sync_status, SyncStatus::InSyncQueue);
    }

    #[tokio::test]
    async fn finish_sync_only_applies_while_syncing() {
        let repo = repository().await;
        let conn = repo.create(1, "a", "github", json!({})).await.unwrap();

        assert!(
            !repo
                .finish_sync(conn.id, SyncStatus::Synced, None)
                .await
                .unwrap()
        );

        repo.claim_for_sync(1).await.unwrap();
        assert!(repo.mark_syncing(conn.id).await.unwrap().is_some());
        assert!(repo.mark_syncing(conn.id).await.unwrap().is_none());

        let metadata = json!({ "warnings": ["Organization ghost not found or no access"] });
        assert!(
            repo.finish_sync(conn.id, SyncStatus::SyncedWithWarnings, Some(metadata.clone()))
                .await
                .unwrap()
        );

        let reloaded = repo.get_by_id(conn.id).await.unwrap().unwrap();
        assert_eq!(reloaded.sync_status, SyncStatus::SyncedWithWarnings);
        assert_eq!(reloaded.sync_status_metadata, Some(metadata));
        assert!(reloaded.synced_at.is_some());
    }

    #[tokio::test]
    async fn request_sync_respects_active_states() {
        let repo = repository().await;
        let conn = repo.create(1, "a", "github", json!({})).await.unwrap();

        set_status(&repo, conn.id, SyncStatus::Syncing).await;
        assert_eq!(
            repo.request_sync(conn.id).await.unwrap(),
            SyncRequest::AlreadyActive(SyncStatus::Syncing)
        );

        set_status(&repo, conn.id, SyncStatus::Failed).await;
        match repo.request_sync(conn.id).await.unwrap() {
            SyncRequest::Flagged(model) => assert_eq!(model.sync_status, SyncStatus::SyncNeeded),
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(
            repo.request_sync(Uuid::new_v4()).await.unwrap(),
            SyncRequest::NotFound
        );
    }

    #[tokio::test]
    async fn interrupted_and_stale_connections_are_flagged() {
        let repo = repository().await;
        let queued = repo.create(1, "queued", "github", json!({})).await.unwrap();
        let synced = repo.create(1, "synced", "github", json!({})).await.unwrap();
        set_status(&repo, queued.id, SyncStatus::Syncing).await;
        set_status(&repo, synced.id, SyncStatus::Synced).await;

        assert_eq!(repo.reset_interrupted().await.unwrap(), 1);

        // `synced` has never recorded a synced_at, so any threshold flags it.
        assert_eq!(
            repo.flag_for_resync(Utc::now() - Duration::days(1))
                .await
                .unwrap(),
            1
        );
        let reloaded = repo.get_by_id(synced.id).await.unwrap().unwrap();
        assert_eq!(reloaded.sync_status, SyncStatus::SyncNeeded);
    }
}
