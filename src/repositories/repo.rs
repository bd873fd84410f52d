//! # Repo Repository
//!
//! Read access to the repo catalog for the operator API. Writes happen in the
//! sync engine (reconciliation) and the job worker (index bookkeeping, cleanup).

use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    RelationTrait,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::repo::{self, Column, Entity as Repo};
use crate::models::repo_to_connection;

/// Repository for repo catalog reads
#[derive(Debug, Clone)]
pub struct RepoRepository {
    db: Arc<DatabaseConnection>,
}

impl RepoRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<repo::Model>, DbErr> {
        Repo::find_by_id(id).one(self.db.as_ref()).await
    }

    /// List repos by name, optionally only those linked to `connection_id`.
    pub async fn list(
        &self,
        connection_id: Option<Uuid>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<repo::Model>, DbErr> {
        let mut query = Repo::find();

        if let Some(connection_id) = connection_id {
            query = query
                .join(
                    sea_orm::JoinType::InnerJoin,
                    repo::Relation::RepoToConnection.def(),
                )
                .filter(repo_to_connection::Column::ConnectionId.eq(connection_id));
        }

        query
            .order_by_asc(Column::Name)
            .order_by_asc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(self.db.as_ref())
            .await
    }

    /// Ids of the connections currently linked to a repo.
    pub async fn connection_ids(&self, repo_id: Uuid) -> Result<Vec<Uuid>, DbErr> {
        repo_to_connection::Entity::find()
            .select_only()
            .column(repo_to_connection::Column::ConnectionId)
            .filter(repo_to_connection::Column::RepoId.eq(repo_id))
            .into_tuple()
            .all(self.db.as_ref())
            .await
    }
}
