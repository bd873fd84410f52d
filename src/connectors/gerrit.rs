//! Gerrit adapter
//!
//! Lists projects through `GET /projects/`, which prefixes its JSON with an
//! XSSI guard and marks the last project of a truncated page with
//! `_more_projects`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::config::{ConnectionConfig, GerritConfig, base_url};
use super::filter::dedup_descriptors;
use super::http::{Auth, HttpClient, PageGuard, encode_component};
use super::trait_::{CodeHostAdapter, ConnectorError, DiscoveryResult, RepoDescriptor};
use super::{hostname, marshal_bool, repo_metadata};
use crate::glob::GlobSet;

pub const CODE_HOST_TYPE: &str = "gerrit";
const XSSI_PREFIX: &str = ")]}'";
const DEFAULT_WEB_URL: &str = "https://www.gerritcodereview.com/";

/// Server-internal projects that are never indexed.
pub const RESERVED_PROJECTS: [&str; 4] = [
    "All-Projects",
    "All-Users",
    "All-Avatars",
    "All-Archived-Projects",
];

#[derive(Debug, Clone, Deserialize)]
pub struct GerritWebLink {
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GerritProject {
    pub id: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub web_links: Vec<GerritWebLink>,
    #[serde(default, rename = "_more_projects")]
    pub more_projects: bool,
}

impl GerritProject {
    fn has_state(&self, state: &str) -> bool {
        self.state.as_deref() == Some(state)
    }
}

/// Adapter for Gerrit Code Review servers.
#[derive(Debug, Clone)]
pub struct GerritAdapter {
    http: HttpClient,
}

impl GerritAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    async fn list(&self, base: &Url) -> Result<Vec<(String, GerritProject)>, ConnectorError> {
        let listing = base
            .join("projects/")
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        let identifier = format!("gerrit:{}", base);

        let mut projects = Vec::new();
        let mut guard = PageGuard::new(identifier.clone());
        let mut start = 0usize;

        loop {
            let mut url = listing.clone();
            url.query_pairs_mut().append_pair("S", &start.to_string());
            guard.advance(url.as_str())?;

            let response = self.http.get_text(&url, &Auth::None, &identifier).await?;
            let page = parse_projects(&response.body, &url)?;
            let count = page.len();
            let more = page.values().any(|project| project.more_projects);
            debug!(start, count, more, "Fetched Gerrit projects");

            projects.extend(page);

            if !more || count == 0 {
                break;
            }
            start += count;
        }

        Ok(projects)
    }

    fn keep(
        name: &str,
        project: &GerritProject,
        include: &GlobSet,
        exclude: &GlobSet,
        config: &GerritConfig,
    ) -> bool {
        let reason = if RESERVED_PROJECTS.contains(&name) {
            Some("reserved project")
        } else if !include.is_empty() && !include.is_match(name) {
            Some("not matched by `projects`")
        } else if exclude.is_match(name) {
            Some("matched by `exclude.projects`")
        } else if config.exclude.read_only && project.has_state("READ_ONLY") {
            Some("`exclude.readOnly` is true")
        } else if config.exclude.hidden && project.has_state("HIDDEN") {
            Some("`exclude.hidden` is true")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                debug!(project = name, reason, "Excluding Gerrit project");
                false
            }
            None => true,
        }
    }

    fn to_descriptor(
        name: String,
        project: GerritProject,
        base: &Url,
        host: &str,
        host_name: &str,
        config: &GerritConfig,
    ) -> Result<RepoDescriptor, ConnectorError> {
        let display_name = format!("{}/{}", host_name, name);
        let clone_url = base
            .join(&encode_component(&name))
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?
            .to_string();

        let web_url = match project.web_links.first() {
            Some(link) => base
                .join(&link.url)
                .map(|url| url.to_string())
                .unwrap_or_else(|_| link.url.clone()),
            None => DEFAULT_WEB_URL.to_string(),
        };

        let git_config = vec![
            ("zoekt.web-url-type", "gitiles".to_string()),
            ("zoekt.web-url", web_url.clone()),
            ("zoekt.name", display_name.clone()),
            ("zoekt.archived", marshal_bool(false)),
            ("zoekt.fork", marshal_bool(false)),
            ("zoekt.public", marshal_bool(true)),
        ];

        Ok(RepoDescriptor {
            external_id: project.id,
            external_code_host_type: CODE_HOST_TYPE.to_string(),
            external_code_host_url: host.to_string(),
            name: display_name,
            clone_url,
            web_url: Some(web_url),
            image_url: None,
            is_fork: false,
            is_archived: false,
            topics: Vec::new(),
            metadata: repo_metadata(git_config, config.revisions.as_ref()),
        })
    }
}

/// Parse a `/projects/` response body, stripping the XSSI guard.
pub fn parse_projects(
    body: &str,
    url: &Url,
) -> Result<BTreeMap<String, GerritProject>, ConnectorError> {
    let json = body.trim_start().strip_prefix(XSSI_PREFIX).unwrap_or(body);
    serde_json::from_str(json).map_err(|err| ConnectorError::Decode {
        context: url.to_string(),
        message: err.to_string(),
    })
}

#[async_trait]
impl CodeHostAdapter for GerritAdapter {
    fn code_host_type(&self) -> &'static str {
        CODE_HOST_TYPE
    }

    async fn discover(
        &self,
        config: &ConnectionConfig,
        _token: Option<&str>,
    ) -> Result<DiscoveryResult, ConnectorError> {
        let ConnectionConfig::Gerrit(config) = config else {
            return Err(ConnectorError::InvalidConfig(
                "expected a gerrit connection config".to_string(),
            ));
        };

        let base = base_url(&config.url)?;
        let host = config.url.trim_end_matches('/').to_string();
        let host_name = hostname(&host)?;
        let include = GlobSet::new(&config.projects)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        let exclude = GlobSet::new(&config.exclude.projects)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;

        let projects = self.list(&base).await?;
        let discovered = projects.len();

        let descriptors = projects
            .into_iter()
            .filter(|(name, project)| Self::keep(name, project, &include, &exclude, config))
            .map(|(name, project)| {
                Self::to_descriptor(name, project, &base, &host, &host_name, config)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let repos = dedup_descriptors(descriptors);

        info!(
            host = %host,
            discovered,
            kept = repos.len(),
            "Gerrit discovery finished"
        );

        Ok(DiscoveryResult {
            repos,
            warnings: Vec::new(),
        })
    }
}
