//! Declarative connections file.
//!
//! A JSON document naming the connections of one org:
//!
//! ```json
//! { "connections": { "acme-github": { "type": "github", "orgs": ["acme"] } } }
//! ```
//!
//! Applying the file creates missing connections, flags changed ones for a
//! sync and deletes declarative connections the file no longer names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sea_orm::DbErr;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use crate::connectors::ConnectionConfig;
use crate::repositories::{ConnectionRepository, DeclarativeUpsert, SyncRequest};

/// Org that owns connections declared in the file.
pub const DECLARATIVE_ORG_ID: i32 = 1;

/// Errors raised while loading or applying a connections file.
#[derive(Debug, Error)]
pub enum ConnectionsFileError {
    #[error("failed to read connections file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse connections file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("connection '{name}' is invalid: {message}")]
    InvalidConnection { name: String, message: String },
    #[error(transparent)]
    Db(#[from] DbErr),
}

/// Parsed connections file, keyed by connection name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionsFile {
    #[serde(default)]
    pub connections: BTreeMap<String, JsonValue>,
}

/// Counts of what applying a connections file did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub created: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl ConnectionsFile {
    /// Read and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConnectionsFileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConnectionsFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: Self =
            serde_json::from_str(&contents).map_err(|source| ConnectionsFileError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        file.validate()?;
        Ok(file)
    }

    /// Every entry needs a `type` and must parse as that provider's config.
    pub fn validate(&self) -> Result<(), ConnectionsFileError> {
        for (name, config) in &self.connections {
            let connection_type = connection_type(name, config)?;
            ConnectionConfig::parse(config, connection_type).map_err(|err| {
                ConnectionsFileError::InvalidConnection {
                    name: name.clone(),
                    message: err.to_string(),
                }
            })?;
        }
        Ok(())
    }

    /// Write the file's connections into `org_id`.
    ///
    /// New connections start in `SYNC_NEEDED`. A changed connection is flagged
    /// through the same guarded transition as a manual retry, so one that is
    /// queued or syncing keeps its status and picks up the new config on its
    /// next sync.
    pub async fn apply(
        &self,
        connections: &ConnectionRepository,
        org_id: i32,
    ) -> Result<ApplyStats, ConnectionsFileError> {
        self.validate()?;
        let mut stats = ApplyStats::default();

        for (name, config) in &self.connections {
            let connection_type = connection_type(name, config)?;
            match connections
                .upsert_declarative(org_id, name, connection_type, config.clone())
                .await?
            {
                DeclarativeUpsert::Created(model) => {
                    info!(connection_id = %model.id, name = %name, "Created declarative connection");
                    stats.created += 1;
                }
                DeclarativeUpsert::Changed(model) => {
                    let request = connections.request_sync(model.id).await?;
                    let flagged = matches!(request, SyncRequest::Flagged(_));
                    info!(
                        connection_id = %model.id,
                        name = %name,
                        flagged,
                        "Declarative connection config changed"
                    );
                    stats.changed += 1;
                }
                DeclarativeUpsert::Unchanged(_) => stats.unchanged += 1,
            }
        }

        let keep: Vec<String> = self.connections.keys().cloned().collect();
        for model in connections.delete_declarative_except(org_id, &keep).await? {
            info!(connection_id = %model.id, name = %model.name, "Deleted declarative connection");
            stats.deleted += 1;
        }

        Ok(stats)
    }
}

fn connection_type<'a>(name: &str, config: &'a JsonValue) -> Result<&'a str, ConnectionsFileError> {
    config
        .get("type")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ConnectionsFileError::InvalidConnection {
            name: name.to_string(),
            message: "missing string field 'type'".to_string(),
        })
}
