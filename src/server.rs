//! # Server Configuration
//!
//! This module contains the router and server setup for the operator API.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::handlers;
use crate::telemetry::{TraceContext, with_trace_context};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub metrics: PrometheusHandle,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/connections", get(handlers::connections::list_connections))
        .route(
            "/connections/{id}/sync",
            post(handlers::connections::request_sync),
        )
        .route("/repos", get(handlers::repos::list_repos))
        .route("/repos/{id}/jobs", get(handlers::repos::list_repo_jobs))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context))
        .layer(TraceLayer::new_for_http())
}

/// Scope each request in a trace context so error bodies carry its id.
async fn trace_context(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    with_trace_context(TraceContext { trace_id }, next.run(request)).await
}

/// Serve the operator API until `shutdown` fires.
pub async fn run_server(
    config: &AppConfig,
    db: Arc<DatabaseConnection>,
    metrics: PrometheusHandle,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_app(AppState { db, metrics });

    let addr = config.bind_addr().context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, profile = %config.profile, "Operator API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("operator API server failed")?;

    info!("Operator API stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::metrics,
        crate::handlers::connections::list_connections,
        crate::handlers::connections::request_sync,
        crate::handlers::repos::list_repos,
        crate::handlers::repos::list_repo_jobs,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::connections::ConnectionInfo,
            crate::handlers::connections::ConnectionsResponse,
            crate::handlers::repos::RepoInfo,
            crate::handlers::repos::ReposResponse,
            crate::handlers::repos::RepoJobInfo,
            crate::handlers::repos::RepoJobsResponse,
            crate::models::connection::SyncStatus,
            crate::models::repo_job::RepoJobType,
            crate::models::repo_job::RepoJobStatus,
            crate::error::ApiError,
        )
    ),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "connections", description = "Connection sync status and manual retries"),
        (name = "repos", description = "Repo catalog and index job history"),
    ),
    info(
        title = "Repo Sync API",
        description = "Operator API for the code host sync and indexing service",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
