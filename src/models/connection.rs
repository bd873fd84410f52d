//! Connection entity model
//!
//! This module contains the SeaORM entity model for the connections table,
//! which stores one configured link to a code host together with its sync state.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Sync state of a connection.
///
/// `SYNC_NEEDED -> IN_SYNC_QUEUE -> SYNCING -> {SYNCED | SYNCED_WITH_WARNINGS | FAILED}`.
/// Terminal states return to `SYNC_NEEDED` through a manual retry or the resync poller.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[sea_orm(string_value = "SYNC_NEEDED")]
    SyncNeeded,
    #[sea_orm(string_value = "IN_SYNC_QUEUE")]
    InSyncQueue,
    #[sea_orm(string_value = "SYNCING")]
    Syncing,
    #[sea_orm(string_value = "SYNCED")]
    Synced,
    #[sea_orm(string_value = "SYNCED_WITH_WARNINGS")]
    SyncedWithWarnings,
    #[sea_orm(string_value = "FAILED")]
    Failed,
}

impl SyncStatus {
    /// States from which a connection may be flagged for another sync.
    pub const TERMINAL: [SyncStatus; 3] = [
        SyncStatus::Synced,
        SyncStatus::SyncedWithWarnings,
        SyncStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

/// Connection entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Organization that owns the connection and every repo it discovers
    pub org_id: i32,

    /// Human readable connection name (unique per org)
    pub name: String,

    /// Code host type (github, gitlab, gitea, gerrit, bitbucket, azuredevops, git)
    pub connection_type: String,

    /// Provider specific discovery configuration
    #[sea_orm(column_type = "JsonBinary")]
    pub config: JsonValue,

    /// Current sync state
    pub sync_status: SyncStatus,

    /// Structured error or warning payload from the last sync
    #[sea_orm(column_type = "JsonBinary")]
    pub sync_status_metadata: Option<JsonValue>,

    /// Managed by the connections file; removed when the file drops it
    pub is_declarative: bool,

    /// Timestamp of the last finished sync, successful or not
    pub synced_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the connection was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the connection was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::repo_to_connection::Entity")]
    RepoToConnection,
}

impl Related<super::repo_to_connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RepoToConnection.def()
    }
}

impl Related<super::repo::Entity> for Entity {
    fn to() -> RelationDef {
        super::repo_to_connection::Relation::Repo.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::repo_to_connection::Relation::Connection.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}
