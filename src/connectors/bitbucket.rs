//! Bitbucket adapter
//!
//! Bitbucket Cloud (`api.bitbucket.org/2.0`) paginates with a `next` URL in
//! the body; Bitbucket Server/Data Center (`/rest/api/1.0`) with
//! `isLastPage`/`nextPageStart`. Exclusion globs match `workspace/PROJECT/slug`
//! on cloud and `PROJECT/slug` on server.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use url::Url;

use super::config::{
    BITBUCKET_CLOUD_URL, BitbucketConfig, BitbucketDeployment, ConnectionConfig, base_url,
};
use super::filter::{Candidate, RepoFilter, dedup_descriptors};
use super::http::{Auth, HttpClient, PageGuard, encode_component, redact};
use super::trait_::{
    CodeHostAdapter, ConnectorError, DiscoveryResult, RepoDescriptor, warn_if_missing,
};
use super::{host_url, hostname, marshal_bool, repo_metadata};

pub const CODE_HOST_TYPE: &str = "bitbucket";
pub const CLOUD_API_URL: &str = "https://api.bitbucket.org/2.0/";
const SERVER_PAGE_SIZE: usize = 100;
// Commit links on both deployments follow the server layout.
const WEB_URL_TYPE: &str = "bitbucket-server";

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudLinks {
    #[serde(default)]
    pub clone: Vec<Link>,
    #[serde(default)]
    pub html: Option<Link>,
    #[serde(default)]
    pub avatar: Option<Link>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRef {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudRepo {
    pub uuid: String,
    pub full_name: String,
    #[serde(default)]
    pub project: Option<ProjectRef>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub parent: Option<serde_json::Value>,
    #[serde(default)]
    pub links: CloudLinks,
}

impl CloudRepo {
    /// `workspace/PROJECT/slug`
    pub fn qualified_name(&self) -> String {
        let (workspace, slug) = self
            .full_name
            .split_once('/')
            .unwrap_or(("", self.full_name.as_str()));
        let project = self.project.as_ref().map_or("", |p| p.key.as_str());
        format!("{}/{}/{}", workspace, project, slug)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CloudPage<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerLinks {
    #[serde(default)]
    pub clone: Vec<Link>,
    #[serde(default, rename = "self")]
    pub self_: Vec<Link>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRepo {
    pub id: u64,
    pub slug: String,
    pub project: ProjectRef,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub origin: Option<serde_json::Value>,
    #[serde(default)]
    pub links: ServerLinks,
}

impl ServerRepo {
    /// `PROJECT/slug`
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.project.key, self.slug)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPage<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    #[serde(default = "default_last_page")]
    is_last_page: bool,
    #[serde(default)]
    next_page_start: Option<usize>,
}

fn default_last_page() -> bool {
    true
}

/// Adapter for Bitbucket Cloud and Bitbucket Server/Data Center.
#[derive(Debug, Clone)]
pub struct BitbucketAdapter {
    http: HttpClient,
    cloud_api: String,
}

impl BitbucketAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            cloud_api: CLOUD_API_URL.to_string(),
        }
    }

    /// Point cloud API calls at another base URL, e.g. a mock server.
    pub fn with_cloud_api_base(mut self, base: impl Into<String>) -> Self {
        self.cloud_api = base.into();
        self
    }

    fn auth(config: &BitbucketConfig, token: Option<&str>) -> Auth {
        match (config.deployment_type, config.user.as_deref(), token) {
            (BitbucketDeployment::Cloud, Some(user), Some(token)) => Auth::Basic {
                username: user.to_string(),
                password: token.to_string(),
            },
            _ => Auth::bearer(token),
        }
    }

    fn filter(config: &BitbucketConfig) -> Result<RepoFilter, ConnectorError> {
        Ok(RepoFilter::new()
            .exclude_forks(config.exclude.forks)
            .exclude_archived(config.exclude.archived)
            .exclude_names(&config.exclude.repos)?)
    }

    fn join(base: &Url, path: &str) -> Result<Url, ConnectorError> {
        base.join(path)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))
    }

    async fn cloud_list(
        &self,
        first: Url,
        auth: &Auth,
        identifier: &str,
    ) -> Result<Vec<CloudRepo>, ConnectorError> {
        let mut repos = Vec::new();
        let mut guard = PageGuard::new(identifier);
        let mut next = Some(first);

        while let Some(url) = next.take() {
            guard.advance(url.as_str())?;
            let page = self
                .http
                .get_json::<CloudPage<CloudRepo>>(&url, auth, identifier)
                .await?
                .body;
            debug!(identifier, count = page.values.len(), "Fetched Bitbucket Cloud page");
            repos.extend(page.values);

            next = match page.next {
                Some(link) => Some(Url::parse(&link).map_err(|err| {
                    ConnectorError::Pagination(format!("invalid next link '{}': {}", link, err))
                })?),
                None => None,
            };
        }

        Ok(repos)
    }

    async fn server_list(
        &self,
        base: Url,
        auth: &Auth,
        identifier: &str,
    ) -> Result<Vec<ServerRepo>, ConnectorError> {
        let mut repos = Vec::new();
        let mut guard = PageGuard::new(identifier);
        let mut start = 0usize;

        loop {
            let mut url = base.clone();
            url.query_pairs_mut()
                .append_pair("start", &start.to_string())
                .append_pair("limit", &SERVER_PAGE_SIZE.to_string());
            guard.advance(url.as_str())?;

            let page = self
                .http
                .get_json::<ServerPage<ServerRepo>>(&url, auth, identifier)
                .await?
                .body;
            debug!(
                identifier,
                start,
                count = page.values.len(),
                last = page.is_last_page,
                "Fetched Bitbucket Server page"
            );
            repos.extend(page.values);

            if page.is_last_page {
                break;
            }
            start = page.next_page_start.ok_or_else(|| {
                ConnectorError::Pagination(format!(
                    "{} reported more pages without nextPageStart",
                    identifier
                ))
            })?;
        }

        Ok(repos)
    }

    async fn get_one<T: DeserializeOwned>(
        &self,
        url: &Url,
        auth: &Auth,
        identifier: &str,
    ) -> Result<Vec<T>, ConnectorError> {
        self.http
            .get_json::<T>(url, auth, identifier)
            .await
            .map(|response| vec![response.body])
    }

    async fn discover_cloud(
        &self,
        config: &BitbucketConfig,
        auth: &Auth,
    ) -> Result<DiscoveryResult, ConnectorError> {
        let api = base_url(&self.cloud_api)?;
        let host = host_url(config.url.as_deref(), BITBUCKET_CLOUD_URL);
        let host_name = hostname(&host)?;
        let filter = Self::filter(config)?;

        let mut found = Vec::new();
        let mut warnings = Vec::new();

        for workspace in &config.workspaces {
            let url = Self::join(&api, &format!("repositories/{}", encode_component(workspace)))?;
            let repos = self
                .cloud_list(url, auth, &format!("bitbucket:workspace:{}", workspace))
                .await;
            found.extend(warn_if_missing(repos, &mut warnings, || {
                format!("Workspace {} not found or no access", workspace)
            })?);
        }

        for project in &config.projects {
            let Some((workspace, key)) = project.split_once('/') else {
                return Err(ConnectorError::InvalidConfig(format!(
                    "project '{}' must be WORKSPACE/PROJECT_KEY",
                    project
                )));
            };
            let mut url =
                Self::join(&api, &format!("repositories/{}", encode_component(workspace)))?;
            url.query_pairs_mut()
                .append_pair("q", &format!("project.key=\"{}\"", key));
            let repos = self
                .cloud_list(url, auth, &format!("bitbucket:project:{}", project))
                .await;
            found.extend(warn_if_missing(repos, &mut warnings, || {
                format!("Project {} not found or no access", project)
            })?);
        }

        for repo in &config.repos {
            let Some((workspace, slug)) = repo.split_once('/') else {
                return Err(ConnectorError::InvalidConfig(format!(
                    "repo '{}' must be WORKSPACE/REPO",
                    repo
                )));
            };
            let url = Self::join(
                &api,
                &format!(
                    "repositories/{}/{}",
                    encode_component(workspace),
                    encode_component(slug)
                ),
            )?;
            let fetched = self
                .get_one::<CloudRepo>(&url, auth, &format!("bitbucket:repo:{}", repo))
                .await;
            found.extend(warn_if_missing(fetched, &mut warnings, || {
                format!("Repository {} not found or no access", repo)
            })?);
        }

        let discovered = found.len();
        let descriptors: Vec<RepoDescriptor> = found
            .into_iter()
            .filter_map(|repo| {
                let qualified_name = repo.qualified_name();
                let keep = filter.keep(&Candidate {
                    qualified_name: &qualified_name,
                    is_fork: repo.parent.is_some(),
                    is_archived: false,
                    topics: &[],
                    size_bytes: None,
                });
                if !keep {
                    return None;
                }
                let clone_url = cloud_clone_url(&repo)?;
                Some(cloud_descriptor(repo, clone_url, &host, &host_name, config))
            })
            .collect();
        let repos = dedup_descriptors(descriptors);

        info!(
            host = %host,
            discovered,
            kept = repos.len(),
            warnings = warnings.len(),
            "Bitbucket Cloud discovery finished"
        );

        Ok(DiscoveryResult { repos, warnings })
    }

    async fn discover_server(
        &self,
        config: &BitbucketConfig,
        auth: &Auth,
    ) -> Result<DiscoveryResult, ConnectorError> {
        let Some(url) = config.url.as_deref() else {
            return Err(ConnectorError::InvalidConfig(
                "`url` is required for Bitbucket Server".to_string(),
            ));
        };
        let host = url.trim_end_matches('/').to_string();
        let host_name = hostname(&host)?;
        let api = base_url(&format!("{}/rest/api/1.0", host))?;
        let filter = Self::filter(config)?;

        let mut found = Vec::new();
        let mut warnings = Vec::new();

        for key in &config.projects {
            let listing = Self::join(&api, &format!("projects/{}/repos", encode_component(key)))?;
            let repos = self
                .server_list(listing, auth, &format!("bitbucket:project:{}", key))
                .await;
            found.extend(warn_if_missing(repos, &mut warnings, || {
                format!("Project {} not found or no access", key)
            })?);
        }

        for repo in &config.repos {
            let Some((key, slug)) = repo.split_once('/') else {
                return Err(ConnectorError::InvalidConfig(format!(
                    "repo '{}' must be PROJECT_KEY/REPO",
                    repo
                )));
            };
            let url = Self::join(
                &api,
                &format!(
                    "projects/{}/repos/{}",
                    encode_component(key),
                    encode_component(slug)
                ),
            )?;
            let fetched = self
                .get_one::<ServerRepo>(&url, auth, &format!("bitbucket:repo:{}", repo))
                .await;
            found.extend(warn_if_missing(fetched, &mut warnings, || {
                format!("Repository {} not found or no access", repo)
            })?);
        }

        if config.projects.is_empty() && config.repos.is_empty() {
            let listing = Self::join(&api, "repos")?;
            found.extend(self.server_list(listing, auth, "bitbucket:all").await?);
        }

        let discovered = found.len();
        let descriptors: Vec<RepoDescriptor> = found
            .into_iter()
            .filter_map(|repo| {
                let qualified_name = repo.qualified_name();
                let keep = filter.keep(&Candidate {
                    qualified_name: &qualified_name,
                    is_fork: repo.origin.is_some(),
                    is_archived: repo.archived,
                    topics: &[],
                    size_bytes: None,
                });
                if !keep {
                    return None;
                }
                let clone_url = server_clone_url(&repo)?;
                Some(server_descriptor(repo, clone_url, &host, &host_name, config))
            })
            .collect();
        let repos = dedup_descriptors(descriptors);

        info!(
            host = %host,
            discovered,
            kept = repos.len(),
            warnings = warnings.len(),
            "Bitbucket Server discovery finished"
        );

        Ok(DiscoveryResult { repos, warnings })
    }
}

fn find_clone_link<'a>(links: &'a [Link], name: &str) -> Option<&'a Link> {
    links
        .iter()
        .find(|link| link.name.as_deref() == Some(name))
}

fn cloud_clone_url(repo: &CloudRepo) -> Option<String> {
    let link = find_clone_link(&repo.links.clone, "https")?;
    Url::parse(&link.href).ok().map(|url| redact(&url))
}

fn server_clone_url(repo: &ServerRepo) -> Option<String> {
    let link = find_clone_link(&repo.links.clone, "http")?;
    Url::parse(&link.href).ok().map(|url| redact(&url))
}

fn cloud_descriptor(
    repo: CloudRepo,
    clone_url: String,
    host: &str,
    host_name: &str,
    config: &BitbucketConfig,
) -> RepoDescriptor {
    let name = format!("{}/{}", host_name, repo.full_name);
    let is_fork = repo.parent.is_some();
    let web_url = repo.links.html.map(|link| link.href);

    let mut git_config = vec![
        ("zoekt.web-url-type", WEB_URL_TYPE.to_string()),
        ("zoekt.name", name.clone()),
        ("zoekt.archived", marshal_bool(false)),
        ("zoekt.fork", marshal_bool(is_fork)),
        ("zoekt.public", marshal_bool(!repo.is_private)),
    ];
    if let Some(web_url) = &web_url {
        git_config.push(("zoekt.web-url", web_url.clone()));
    }

    RepoDescriptor {
        external_id: repo.uuid,
        external_code_host_type: CODE_HOST_TYPE.to_string(),
        external_code_host_url: host.to_string(),
        name,
        clone_url,
        web_url,
        image_url: repo.links.avatar.map(|link| link.href),
        is_fork,
        is_archived: false,
        topics: Vec::new(),
        metadata: repo_metadata(git_config, config.revisions.as_ref()),
    }
}

fn server_descriptor(
    repo: ServerRepo,
    clone_url: String,
    host: &str,
    host_name: &str,
    config: &BitbucketConfig,
) -> RepoDescriptor {
    let name = format!("{}/{}", host_name, repo.qualified_name());
    let is_fork = repo.origin.is_some();
    let web_url = repo.links.self_.first().map(|link| link.href.clone());

    let mut git_config = vec![
        ("zoekt.web-url-type", WEB_URL_TYPE.to_string()),
        ("zoekt.name", name.clone()),
        ("zoekt.archived", marshal_bool(repo.archived)),
        ("zoekt.fork", marshal_bool(is_fork)),
        ("zoekt.public", marshal_bool(repo.public)),
    ];
    if let Some(web_url) = &web_url {
        git_config.push(("zoekt.web-url", web_url.clone()));
    }

    RepoDescriptor {
        external_id: repo.id.to_string(),
        external_code_host_type: CODE_HOST_TYPE.to_string(),
        external_code_host_url: host.to_string(),
        name,
        clone_url,
        web_url,
        image_url: None,
        is_fork,
        is_archived: repo.archived,
        topics: Vec::new(),
        metadata: repo_metadata(git_config, config.revisions.as_ref()),
    }
}

#[async_trait]
impl CodeHostAdapter for BitbucketAdapter {
    fn code_host_type(&self) -> &'static str {
        CODE_HOST_TYPE
    }

    async fn discover(
        &self,
        config: &ConnectionConfig,
        token: Option<&str>,
    ) -> Result<DiscoveryResult, ConnectorError> {
        let ConnectionConfig::Bitbucket(config) = config else {
            return Err(ConnectorError::InvalidConfig(
                "expected a bitbucket connection config".to_string(),
            ));
        };

        let auth = Self::auth(config, token);
        match config.deployment_type {
            BitbucketDeployment::Cloud => self.discover_cloud(config, &auth).await,
            BitbucketDeployment::Server => self.discover_server(config, &auth).await,
        }
    }
}
