//! Repo entity model
//!
//! The catalog entry for one remote repository, keyed by
//! `(external_id, external_code_host_url)`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Repo entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repos")]
pub struct Model {
    /// Unique identifier for the repo (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Organization the repo belongs to; part of the index shard prefix
    pub org_id: i32,

    /// Display name, e.g. `github.com/org/repo`
    pub name: String,

    /// URL used for clone and fetch
    pub clone_url: String,

    /// Browser URL of the repository, when the host exposes one
    pub web_url: Option<String>,

    /// Avatar or logo URL
    pub image_url: Option<String>,

    pub is_fork: bool,

    pub is_archived: bool,

    /// Host specific extras, see [`RepoMetadata`]
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: JsonValue,

    /// Identifier of the repository on its code host
    pub external_id: String,

    /// Code host type the repo was discovered on
    pub external_code_host_type: String,

    /// Base URL of the code host the repo was discovered on
    pub external_code_host_url: String,

    /// When the repo was last indexed successfully
    pub indexed_at: Option<DateTimeWithTimeZone>,

    /// HEAD commit of the last successful index
    pub indexed_commit_hash: Option<String>,

    pub created_at: DateTimeWithTimeZone,

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

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        super::repo_to_connection::Relation::Connection.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::repo_to_connection::Relation::Repo.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Typed view over the `metadata` JSON column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoMetadata {
    /// Entries written into the clone's git config, e.g. `zoekt.web-url`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub git_config: BTreeMap<String, String>,

    /// Branch globs selecting which refs get indexed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,

    /// Tag globs selecting which refs get indexed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    /// Revisions included in the last successful index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_revisions: Option<Vec<String>>,
}

impl RepoMetadata {
    /// Parse metadata leniently; unknown or malformed payloads yield defaults.
    pub fn from_json(value: &JsonValue) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| JsonValue::Object(Default::default()))
    }
}
