//! Connectors module
//!
//! This module provides code host discovery including:
//! - The `CodeHostAdapter` trait and the normalized `RepoDescriptor`
//! - Connection configuration, token resolution and inclusion/exclusion rules
//! - The adapter registry and one adapter per provider

pub mod azuredevops;
pub mod bitbucket;
pub mod config;
pub mod filter;
pub mod gerrit;
pub mod git;
pub mod gitea;
pub mod github;
pub mod gitlab;
pub mod http;
pub mod registry;
pub mod token;
pub mod trait_;

pub use config::{ConnectionConfig, RevisionsConfig, TokenConfig};
pub use filter::{RepoFilter, dedup_descriptors};
pub use http::HttpClient;
pub use registry::{Registry, RegistryError};
pub use token::{TokenResolver, git_auth_header};
pub use trait_::{
    CodeHostAdapter, ConnectorError, DiscoveryResult, RepoDescriptor, SyncErrorMetadata,
};

pub use azuredevops::AzureDevOpsAdapter;
pub use bitbucket::BitbucketAdapter;
pub use gerrit::GerritAdapter;
pub use git::GenericGitAdapter;
pub use gitea::GiteaAdapter;
pub use github::GitHubAdapter;
pub use gitlab::GitLabAdapter;

use crate::models::repo::RepoMetadata;

/// `"1"`/`"0"` as stored in `zoekt.*` git config flags.
pub(crate) fn marshal_bool(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

/// Repo metadata from `zoekt.*` git config entries and the connection's revision globs.
pub(crate) fn repo_metadata<I, K>(git_config: I, revisions: Option<&RevisionsConfig>) -> RepoMetadata
where
    I: IntoIterator<Item = (K, String)>,
    K: Into<String>,
{
    RepoMetadata {
        git_config: git_config
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect(),
        branches: revisions.and_then(|r| r.branches.clone()),
        tags: revisions.and_then(|r| r.tags.clone()),
        indexed_revisions: None,
    }
}

/// Configured host URL without a trailing slash, or the provider default.
pub(crate) fn host_url(configured: Option<&str>, default: &str) -> String {
    configured
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

/// Host name of a code host URL, used to prefix repo display names.
pub(crate) fn hostname(url: &str) -> Result<String, ConnectorError> {
    let parsed = url::Url::parse(url)
        .map_err(|err| ConnectorError::InvalidConfig(format!("invalid url '{}': {}", url, err)))?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| ConnectorError::InvalidConfig(format!("url '{}' has no host", url)))
}
