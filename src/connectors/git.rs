//! Generic git host adapter
//!
//! A `git` connection names exactly one repository by URL. Remote URLs are
//! taken as-is; `file://` URLs must point at an existing git repository and
//! are indexed read-only.

use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};
use url::Url;

use super::config::ConnectionConfig;
use super::http::redact;
use super::trait_::{CodeHostAdapter, ConnectorError, DiscoveryResult, RepoDescriptor};
use super::{marshal_bool, repo_metadata};

pub const CODE_HOST_TYPE: &str = "git";
pub const LOCAL_HOST_URL: &str = "file://";

/// Adapter for a single git URL, remote or local.
#[derive(Debug, Clone, Default)]
pub struct GenericGitAdapter;

impl GenericGitAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Whether `path` looks like a git repository root, bare or not.
pub fn looks_like_git_repo(path: &Path) -> bool {
    path.join(".git").exists() || (path.join("HEAD").is_file() && path.join("objects").is_dir())
}

/// `host/path` without a trailing `.git`, e.g. `git.example.com/team/app`.
fn display_name(url: &Url) -> String {
    let path = url.path().trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    match url.host_str() {
        Some(host) if !host.is_empty() => format!("{}/{}", host, path),
        _ => path.to_string(),
    }
}

#[async_trait]
impl CodeHostAdapter for GenericGitAdapter {
    fn code_host_type(&self) -> &'static str {
        CODE_HOST_TYPE
    }

    async fn discover(
        &self,
        config: &ConnectionConfig,
        _token: Option<&str>,
    ) -> Result<DiscoveryResult, ConnectorError> {
        let ConnectionConfig::Git(config) = config else {
            return Err(ConnectorError::InvalidConfig(
                "expected a git connection config".to_string(),
            ));
        };

        let url = Url::parse(&config.url).map_err(|err| {
            ConnectorError::InvalidConfig(format!("invalid url '{}': {}", config.url, err))
        })?;

        let host = if url.scheme() == "file" {
            let path = url.path().to_string();
            let is_dir = tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false);
            if !is_dir || !looks_like_git_repo(Path::new(&path)) {
                let message = format!("{} is not a git repository", path);
                warn!("{}", message);
                return Ok(DiscoveryResult {
                    repos: Vec::new(),
                    warnings: vec![message],
                });
            }
            LOCAL_HOST_URL.to_string()
        } else {
            url.origin().ascii_serialization()
        };

        let clone_url = redact(&url);
        let name = display_name(&url);
        let git_config = vec![
            ("zoekt.name", name.clone()),
            ("zoekt.archived", marshal_bool(false)),
            ("zoekt.fork", marshal_bool(false)),
            ("zoekt.public", marshal_bool(true)),
        ];

        let descriptor = RepoDescriptor {
            external_id: clone_url.clone(),
            external_code_host_type: CODE_HOST_TYPE.to_string(),
            external_code_host_url: host,
            name,
            clone_url,
            web_url: None,
            image_url: None,
            is_fork: false,
            is_archived: false,
            topics: Vec::new(),
            metadata: repo_metadata(git_config, config.revisions.as_ref()),
        };

        info!(repo = %descriptor.name, "Generic git discovery finished");

        Ok(DiscoveryResult {
            repos: vec![descriptor],
            warnings: Vec::new(),
        })
    }
}
