//! # Data Models
//!
//! This module contains the catalog entities persisted by the sync engine.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod repo;
pub mod repo_job;
pub mod repo_to_connection;
pub mod secret;

pub use connection::Entity as Connection;
pub use repo::Entity as Repo;
pub use repo_job::Entity as RepoJob;
pub use repo_to_connection::Entity as RepoToConnection;
pub use secret::Entity as Secret;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "repo-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
