//! # Connection Sync Engine
//!
//! Runs one discovery for a connection and reconciles the result into the repo
//! catalog. Edges owned by the connection are dropped and rebuilt inside the
//! same transaction that creates and updates repos, so a repo that disappeared
//! upstream simply ends up with fewer edges and, once it has none, becomes a
//! cleanup candidate for the index scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::connectors::{
    ConnectionConfig, ConnectorError, DiscoveryResult, Registry, RepoDescriptor,
    SyncErrorMetadata, TokenResolver, dedup_descriptors,
};
use crate::db::db_now;
use crate::models::connection::{self, SyncStatus};
use crate::models::repo::{self, Column as RepoColumn, Entity as Repo, RepoMetadata};
use crate::models::repo_to_connection::{self, Entity as RepoToConnection};
use crate::repositories::ConnectionRepository;
use crate::telemetry::SharedErrorReporter;

/// Rows per multi-row statement.
const WRITE_CHUNK: usize = 500;

/// Counts produced by one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub linked: usize,
}

/// Final state of one sync attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Synced {
        stats: ReconcileStats,
        warnings: Vec<String>,
    },
    Failed(SyncErrorMetadata),
    /// The connection was not `IN_SYNC_QUEUE` when the worker picked it up
    Skipped,
}

/// Discovers and reconciles repos for one connection at a time.
pub struct ConnectionSyncEngine {
    db: Arc<DatabaseConnection>,
    connections: ConnectionRepository,
    registry: Arc<Registry>,
    tokens: TokenResolver,
    reporter: SharedErrorReporter,
    timeout: Duration,
}

impl ConnectionSyncEngine {
    pub fn new(
        db: Arc<DatabaseConnection>,
        registry: Arc<Registry>,
        tokens: TokenResolver,
        reporter: SharedErrorReporter,
        timeout: Duration,
    ) -> Self {
        Self {
            connections: ConnectionRepository::new(db.clone()),
            db,
            registry,
            tokens,
            reporter,
            timeout,
        }
    }

    /// Sync a queued connection. Discovery and reconciliation failures are
    /// recorded on the connection; only failures to record them are returned.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn sync(&self, connection_id: Uuid) -> Result<SyncOutcome, DbErr> {
        let Some(connection) = self.connections.mark_syncing(connection_id).await? else {
            debug!("Connection is not queued for sync, skipping");
            return Ok(SyncOutcome::Skipped);
        };

        let started = Instant::now();
        info!(
            connection_type = %connection.connection_type,
            "Connection sync started"
        );

        let result = tokio::time::timeout(self.timeout, self.discover_and_reconcile(&connection))
            .await
            .unwrap_or_else(|_| Err(ConnectorError::Timeout(self.timeout.as_secs())));

        histogram!("connection_sync_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let outcome = match result {
            Ok((stats, warnings)) => {
                let (status, metadata) = if warnings.is_empty() {
                    (SyncStatus::Synced, None)
                } else {
                    (
                        SyncStatus::SyncedWithWarnings,
                        Some(json!({ "warnings": warnings })),
                    )
                };
                self.connections
                    .finish_sync(connection.id, status, metadata)
                    .await?;
                counter!("connection_sync_total", "status" => "synced").increment(1);
                info!(
                    created = stats.created,
                    updated = stats.updated,
                    unchanged = stats.unchanged,
                    linked = stats.linked,
                    warnings = warnings.len(),
                    "Connection sync finished"
                );
                SyncOutcome::Synced { stats, warnings }
            }
            Err(err) => {
                let metadata = SyncErrorMetadata::from_error(&err);
                self.reporter.report("connection_sync", &err);
                self.connections
                    .finish_sync(connection.id, SyncStatus::Failed, Some(metadata.to_json()))
                    .await?;
                counter!("connection_sync_total", "status" => "failed").increment(1);
                warn!(code = %metadata.code, error = %err, "Connection sync failed");
                SyncOutcome::Failed(metadata)
            }
        };

        Ok(outcome)
    }

    async fn discover_and_reconcile(
        &self,
        connection: &connection::Model,
    ) -> Result<(ReconcileStats, Vec<String>), ConnectorError> {
        let discovery = self.discover(connection).await?;
        let stats = self.reconcile(connection, discovery.repos).await?;
        Ok((stats, discovery.warnings))
    }

    /// Resolve the connection's config and token and run its adapter.
    pub async fn discover(
        &self,
        connection: &connection::Model,
    ) -> Result<DiscoveryResult, ConnectorError> {
        let config = ConnectionConfig::parse(&connection.config, &connection.connection_type)?;
        let adapter = self
            .registry
            .get(&connection.connection_type)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        let token = self.tokens.resolve_for(connection.org_id, &config).await?;

        adapter
            .discover(&config, token.as_ref().map(|t| t.as_str()))
            .await
    }

    /// Rebuild the connection's edges and upsert its repos in one transaction.
    pub async fn reconcile(
        &self,
        connection: &connection::Model,
        descriptors: Vec<RepoDescriptor>,
    ) -> Result<ReconcileStats, DbErr> {
        let descriptors = dedup_descriptors(descriptors);
        let mut stats = ReconcileStats::default();
        let now = db_now();

        let txn = self.db.begin().await?;

        let removed = RepoToConnection::delete_many()
            .filter(repo_to_connection::Column::ConnectionId.eq(connection.id))
            .exec(&txn)
            .await?
            .rows_affected;
        debug!(removed, "Dropped existing edges");

        let existing = load_by_keys(&txn, &descriptors).await?;

        let mut to_create = Vec::new();
        let mut to_update = Vec::new();
        for descriptor in &descriptors {
            let key = (
                descriptor.external_id.clone(),
                descriptor.external_code_host_url.clone(),
            );
            match existing.get(&key) {
                None => to_create.push(new_repo(connection.org_id, descriptor, now)),
                Some(current) => match updated_repo(current, descriptor, now) {
                    Some(model) => to_update.push(model),
                    None => stats.unchanged += 1,
                },
            }
        }
        stats.created = to_create.len();
        stats.updated = to_update.len();

        for chunk in to_create.chunks(WRITE_CHUNK) {
            Repo::insert_many(chunk.to_vec())
                .on_conflict(
                    OnConflict::columns([RepoColumn::ExternalId, RepoColumn::ExternalCodeHostUrl])
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;
        }

        for chunk in to_update.chunks(WRITE_CHUNK) {
            Repo::insert_many(chunk.to_vec())
                .on_conflict(
                    OnConflict::columns([RepoColumn::ExternalId, RepoColumn::ExternalCodeHostUrl])
                        .update_columns([
                            RepoColumn::Name,
                            RepoColumn::CloneUrl,
                            RepoColumn::WebUrl,
                            RepoColumn::ImageUrl,
                            RepoColumn::IsFork,
                            RepoColumn::IsArchived,
                            RepoColumn::Metadata,
                            RepoColumn::ExternalCodeHostType,
                            RepoColumn::UpdatedAt,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;
        }

        // Re-read ids so edges point at the stored rows even when a concurrent
        // sync of another connection inserted the same repo first.
        let stored = load_by_keys(&txn, &descriptors).await?;
        let edges: Vec<repo_to_connection::ActiveModel> = descriptors
            .iter()
            .filter_map(|descriptor| {
                let key = (
                    descriptor.external_id.clone(),
                    descriptor.external_code_host_url.clone(),
                );
                stored.get(&key).map(|repo| repo_to_connection::ActiveModel {
                    repo_id: Set(repo.id),
                    connection_id: Set(connection.id),
                    added_at: Set(now),
                })
            })
            .collect();
        stats.linked = edges.len();

        for chunk in edges.chunks(WRITE_CHUNK) {
            RepoToConnection::insert_many(chunk.to_vec())
                .exec_without_returning(&txn)
                .await?;
        }

        txn.commit().await?;

        counter!("connection_sync_repos_created_total").increment(stats.created as u64);
        counter!("connection_sync_repos_updated_total").increment(stats.updated as u64);

        if stats.linked != descriptors.len() {
            error!(
                expected = descriptors.len(),
                linked = stats.linked,
                "Some discovered repos could not be linked"
            );
        }

        Ok(stats)
    }
}

type RepoKey = (String, String);

/// Existing repos matching any descriptor, keyed by `(external_id, external_code_host_url)`.
async fn load_by_keys<C: ConnectionTrait>(
    db: &C,
    descriptors: &[RepoDescriptor],
) -> Result<HashMap<RepoKey, repo::Model>, DbErr> {
    let mut by_host: HashMap<&str, Vec<&str>> = HashMap::new();
    for descriptor in descriptors {
        by_host
            .entry(descriptor.external_code_host_url.as_str())
            .or_default()
            .push(descriptor.external_id.as_str());
    }

    let mut found = HashMap::new();
    for (host, ids) in by_host {
        for chunk in ids.chunks(WRITE_CHUNK) {
            let rows = Repo::find()
                .filter(RepoColumn::ExternalCodeHostUrl.eq(host))
                .filter(RepoColumn::ExternalId.is_in(chunk.iter().copied()))
                .all(db)
                .await?;
            for row in rows {
                found.insert(
                    (row.external_id.clone(), row.external_code_host_url.clone()),
                    row,
                );
            }
        }
    }

    Ok(found)
}

fn new_repo(
    org_id: i32,
    descriptor: &RepoDescriptor,
    now: sea_orm::prelude::DateTimeWithTimeZone,
) -> repo::ActiveModel {
    repo::ActiveModel {
        id: Set(Uuid::new_v4()),
        org_id: Set(org_id),
        name: Set(descriptor.name.clone()),
        clone_url: Set(descriptor.clone_url.clone()),
        web_url: Set(descriptor.web_url.clone()),
        image_url: Set(descriptor.image_url.clone()),
        is_fork: Set(descriptor.is_fork),
        is_archived: Set(descriptor.is_archived),
        metadata: Set(descriptor.metadata.to_json()),
        external_id: Set(descriptor.external_id.clone()),
        external_code_host_type: Set(descriptor.external_code_host_type.clone()),
        external_code_host_url: Set(descriptor.external_code_host_url.clone()),
        indexed_at: Set(None),
        indexed_commit_hash: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
}

/// The row to upsert when `descriptor` changes any mutable field of `current`.
fn updated_repo(
    current: &repo::Model,
    descriptor: &RepoDescriptor,
    now: sea_orm::prelude::DateTimeWithTimeZone,
) -> Option<repo::ActiveModel> {
    let mut metadata: RepoMetadata = descriptor.metadata.clone();
    metadata.indexed_revisions = RepoMetadata::from_json(&current.metadata).indexed_revisions;
    let metadata = metadata.to_json();

    let unchanged = current.name == descriptor.name
        && current.clone_url == descriptor.clone_url
        && current.web_url == descriptor.web_url
        && current.image_url == descriptor.image_url
        && current.is_fork == descriptor.is_fork
        && current.is_archived == descriptor.is_archived
        && current.external_code_host_type == descriptor.external_code_host_type
        && current.metadata == metadata;
    if unchanged {
        return None;
    }

    Some(repo::ActiveModel {
        id: Set(current.id),
        org_id: Set(current.org_id),
        name: Set(descriptor.name.clone()),
        clone_url: Set(descriptor.clone_url.clone()),
        web_url: Set(descriptor.web_url.clone()),
        image_url: Set(descriptor.image_url.clone()),
        is_fork: Set(descriptor.is_fork),
        is_archived: Set(descriptor.is_archived),
        metadata: Set(metadata),
        external_id: Set(current.external_id.clone()),
        external_code_host_type: Set(descriptor.external_code_host_type.clone()),
        external_code_host_url: Set(current.external_code_host_url.clone()),
        indexed_at: Set(current.indexed_at),
        indexed_commit_hash: Set(current.indexed_commit_hash.clone()),
        created_at: Set(current.created_at),
        updated_at: Set(now),
    })
}
