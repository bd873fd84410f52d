//! # Repos API Handlers
//!
//! Read-only views of the repo catalog and each repo's index job history.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::ApiError;
use crate::handlers::page_limit;
use crate::models::repo;
use crate::models::repo_job::{self, RepoJobStatus, RepoJobType};
use crate::repositories::{RepoJobRepository, RepoRepository};
use crate::server::AppState;

/// Query parameters for repo listing
#[derive(Debug, Default, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct ListReposQuery {
    /// Only repos currently discovered by this connection
    #[param(value_type = Option<String>)]
    #[schema(value_type = Option<String>)]
    pub connection_id: Option<Uuid>,
    /// Maximum number of repos to return (default: 50, max: 100)
    pub limit: Option<u64>,
    /// Number of repos to skip
    pub offset: Option<u64>,
}

/// Repo catalog entry
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RepoInfo {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub org_id: i32,
    #[schema(example = "github.com/acme/api")]
    pub name: String,
    pub clone_url: String,
    pub web_url: Option<String>,
    pub image_url: Option<String>,
    pub is_fork: bool,
    pub is_archived: bool,
    pub external_id: String,
    pub external_code_host_type: String,
    pub external_code_host_url: String,
    pub metadata: serde_json::Value,
    pub indexed_at: Option<String>,
    pub indexed_commit_hash: Option<String>,
}

impl From<repo::Model> for RepoInfo {
    fn from(model: repo::Model) -> Self {
        Self {
            id: model.id,
            org_id: model.org_id,
            name: model.name,
            clone_url: model.clone_url,
            web_url: model.web_url,
            image_url: model.image_url,
            is_fork: model.is_fork,
            is_archived: model.is_archived,
            external_id: model.external_id,
            external_code_host_type: model.external_code_host_type,
            external_code_host_url: model.external_code_host_url,
            metadata: model.metadata,
            indexed_at: model.indexed_at.map(|dt| dt.to_rfc3339()),
            indexed_commit_hash: model.indexed_commit_hash,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReposResponse {
    pub repos: Vec<RepoInfo>,
}

/// One INDEX or CLEANUP job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RepoJobInfo {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub job_type: RepoJobType,
    pub status: RepoJobStatus,
    pub metadata: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl From<repo_job::Model> for RepoJobInfo {
    fn from(model: repo_job::Model) -> Self {
        Self {
            id: model.id,
            job_type: model.job_type,
            status: model.status,
            metadata: model.metadata,
            error_message: model.error_message,
            created_at: model.created_at.to_rfc3339(),
            started_at: model.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RepoJobsResponse {
    pub jobs: Vec<RepoJobInfo>,
}

#[derive(Debug, Default, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct ListRepoJobsQuery {
    /// Maximum number of jobs to return (default: 50, max: 100)
    pub limit: Option<u64>,
}

/// Lists repos in the catalog by name
#[utoipa::path(
    get,
    path = "/repos",
    params(ListReposQuery),
    responses(
        (status = 200, description = "Repos ordered by name", body = ReposResponse),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    tag = "repos"
)]
pub async fn list_repos(
    State(state): State<AppState>,
    Query(query): Query<ListReposQuery>,
) -> Result<Json<ReposResponse>, ApiError> {
    let limit = page_limit(query.limit)?;
    let repos = RepoRepository::new(state.db.clone())
        .list(query.connection_id, limit, query.offset.unwrap_or(0))
        .await?
        .into_iter()
        .map(RepoInfo::from)
        .collect();

    Ok(Json(ReposResponse { repos }))
}

/// Index job history of a repo, newest first
#[utoipa::path(
    get,
    path = "/repos/{id}/jobs",
    params(
        ("id" = String, Path, description = "Repo id (UUID)"),
        ListRepoJobsQuery
    ),
    responses(
        (status = 200, description = "Jobs ordered newest first", body = RepoJobsResponse),
        (status = 404, description = "Repo not found", body = ApiError)
    ),
    tag = "repos"
)]
pub async fn list_repo_jobs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListRepoJobsQuery>,
) -> Result<Json<RepoJobsResponse>, ApiError> {
    let limit = page_limit(query.limit)?;

    if RepoRepository::new(state.db.clone())
        .get_by_id(id)
        .await?
        .is_none()
    {
        return Err(ApiError::not_found("Repo not found"));
    }

    let jobs = RepoJobRepository::new(state.db.clone())
        .list_for_repo(id, limit)
        .await?
        .into_iter()
        .map(RepoJobInfo::from)
        .collect();

    Ok(Json(RepoJobsResponse { jobs }))
}
