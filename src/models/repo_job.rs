//! RepoJob entity model
//!
//! This module contains the SeaORM entity model for the repo_jobs table. Each row
//! is one INDEX or CLEANUP unit of work against a repo and doubles as the durable
//! queue entry the job worker claims.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Kind of work a job performs
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepoJobType {
    #[sea_orm(string_value = "INDEX")]
    Index,
    #[sea_orm(string_value = "CLEANUP")]
    Cleanup,
}

/// Job lifecycle: `PENDING -> IN_PROGRESS -> {COMPLETED | FAILED}`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepoJobStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "IN_PROGRESS")]
    InProgress,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "FAILED")]
    Failed,
}

impl RepoJobStatus {
    pub const ACTIVE: [RepoJobStatus; 2] = [RepoJobStatus::Pending, RepoJobStatus::InProgress];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }
}

/// RepoJob entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repo_jobs")]
pub struct Model {
    /// Job identifier; also the idempotency key for dispatch
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub job_type: RepoJobType,

    pub status: RepoJobStatus,

    /// Repo the job runs against; also its exclusivity group
    pub repo_id: Uuid,

    /// Outcome details such as the indexed commit and revisions
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    /// Failure reason for FAILED jobs
    pub error_message: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    /// When a worker claimed the job
    pub started_at: Option<DateTimeWithTimeZone>,

    /// When the job reached COMPLETED or FAILED
    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
