//! # Connections API Handlers
//!
//! Connection listings with their sync state, and manual sync retries.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::ApiError;
use crate::handlers::page_limit;
use crate::models::connection::{self, SyncStatus};
use crate::repositories::{ConnectionRepository, SyncRequest};
use crate::server::AppState;

/// Query parameters for connections listing
#[derive(Debug, Default, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct ListConnectionsQuery {
    /// Maximum number of connections to return (default: 50, max: 100)
    pub limit: Option<u64>,
    /// Number of connections to skip
    pub offset: Option<u64>,
}

/// Connection information for API responses
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionInfo {
    #[schema(value_type = String, example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: Uuid,
    pub org_id: i32,
    #[schema(example = "acme-github")]
    pub name: String,
    /// Code host type, e.g. "github"
    #[schema(example = "github")]
    pub connection_type: String,
    /// Discovery configuration; tokens appear only as secret or env references
    pub config: serde_json::Value,
    pub sync_status: SyncStatus,
    /// Warnings or structured error from the last sync
    pub sync_status_metadata: Option<serde_json::Value>,
    /// Managed by the connections file
    pub is_declarative: bool,
    /// RFC3339 timestamp of the last finished sync
    pub synced_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<connection::Model> for ConnectionInfo {
    fn from(model: connection::Model) -> Self {
        Self {
            id: model.id,
            org_id: model.org_id,
            name: model.name,
            connection_type: model.connection_type,
            config: model.config,
            sync_status: model.sync_status,
            sync_status_metadata: model.sync_status_metadata,
            is_declarative: model.is_declarative,
            synced_at: model.synced_at.map(|dt| dt.to_rfc3339()),
            created_at: model.created_at.to_rfc3339(),
            updated_at: model.updated_at.to_rfc3339(),
        }
    }
}

/// Response wrapper for connections listing
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionInfo>,
}

/// Lists connections with their sync status
#[utoipa::path(
    get,
    path = "/connections",
    params(ListConnectionsQuery),
    responses(
        (status = 200, description = "Connections ordered by creation time", body = ConnectionsResponse, example = json!({
            "connections": [
                {
                    "id": "550e8400-e29b-41d4-a716-446655440000",
                    "org_id": 1,
                    "name": "acme-github",
                    "connection_type": "github",
                    "config": {"type": "github", "orgs": ["acme"], "token": {"secret": "gh-token"}},
                    "sync_status": "SYNCED_WITH_WARNINGS",
                    "sync_status_metadata": {"warnings": ["Organization ghost not found or no access"]},
                    "is_declarative": true,
                    "synced_at": "2024-01-15T10:32:30+00:00",
                    "created_at": "2024-01-01T00:00:00+00:00",
                    "updated_at": "2024-01-15T10:32:30+00:00"
                }
            ]
        })),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn list_connections(
    State(state): State<AppState>,
    Query(query): Query<ListConnectionsQuery>,
) -> Result<Json<ConnectionsResponse>, ApiError> {
    let limit = page_limit(query.limit)?;
    let repository = ConnectionRepository::new(state.db.clone());

    let connections = repository
        .list(limit, query.offset.unwrap_or(0))
        .await?
        .into_iter()
        .map(ConnectionInfo::from)
        .collect();

    Ok(Json(ConnectionsResponse { connections }))
}

/// Queue a connection for another sync
///
/// Moves a connection in a terminal state back to `SYNC_NEEDED`; the poller
/// picks it up on its next tick.
#[utoipa::path(
    post,
    path = "/connections/{id}/sync",
    params(
        ("id" = String, Path, description = "Connection id (UUID)")
    ),
    responses(
        (status = 202, description = "Connection flagged for sync", body = ConnectionInfo),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 409, description = "Connection is already queued or syncing", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn request_sync(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ConnectionInfo>), ApiError> {
    let repository = ConnectionRepository::new(state.db.clone());

    match repository.request_sync(id).await? {
        SyncRequest::Flagged(model) => {
            tracing::info!(connection_id = %id, "Manual sync requested");
            Ok((StatusCode::ACCEPTED, Json(model.into())))
        }
        SyncRequest::AlreadyActive(status) => Err(ApiError::conflict(
            "Connection is already queued or syncing",
        )
        .with_details(serde_json::json!({ "sync_status": status }))),
        SyncRequest::NotFound => Err(ApiError::not_found("Connection not found")),
    }
}
