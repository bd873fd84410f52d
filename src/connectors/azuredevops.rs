//! Azure DevOps adapter
//!
//! Covers Azure DevOps Services and Azure DevOps Server (including TFS paths).
//! Listings page with the `x-ms-continuationtoken` response header, sent back
//! as the `continuationToken` query parameter until the header is absent.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;

use super::config::{AZURE_DEVOPS_CLOUD_URL, AzureDevOpsConfig, ConnectionConfig, base_url};
use super::filter::{Candidate, RepoFilter, dedup_descriptors};
use super::http::{Auth, HttpClient, PageGuard, encode_component};
use super::trait_::{
    CodeHostAdapter, ConnectorError, DiscoveryResult, RepoDescriptor, warn_if_missing,
};
use super::{host_url, hostname, marshal_bool, repo_metadata};
use crate::glob::GlobSet;

pub const CODE_HOST_TYPE: &str = "azuredevops";
const API_VERSION: &str = "7.1";
const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureProject {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureProjectRef {
    pub name: String,
    #[serde(default)]
    pub visibility: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureRepo {
    pub id: String,
    pub name: String,
    pub project: AzureProjectRef,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub is_fork: bool,
}

/// A repository together with the organization (or collection) it was listed from.
#[derive(Debug, Clone)]
struct Found {
    org: String,
    repo: AzureRepo,
}

/// Adapter for Azure DevOps Services and Server.
#[derive(Debug, Clone)]
pub struct AzureDevOpsAdapter {
    http: HttpClient,
}

impl AzureDevOpsAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    fn org_url(host: &str, org: &str, use_tfs_path: bool) -> Result<Url, ConnectorError> {
        let tfs = if use_tfs_path { "/tfs" } else { "" };
        base_url(&format!("{}{}/{}", host, tfs, encode_component(org)))
    }

    fn api_url(org_url: &Url, path: &str) -> Result<Url, ConnectorError> {
        let mut url = org_url
            .join(path)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        Ok(url)
    }

    /// Fetch every page of a `{ "value": [...] }` listing.
    async fn list<T: DeserializeOwned>(
        &self,
        base: &Url,
        auth: &Auth,
        identifier: &str,
    ) -> Result<Vec<T>, ConnectorError> {
        let mut items = Vec::new();
        let mut guard = PageGuard::new(identifier);
        let mut continuation: Option<String> = None;

        loop {
            let mut url = base.clone();
            if let Some(token) = &continuation {
                url.query_pairs_mut().append_pair("continuationToken", token);
            }
            guard.advance(url.as_str())?;

            let response = self
                .http
                .get_json::<ListResponse<T>>(&url, auth, identifier)
                .await?;
            let received = response.body.value.len();
            items.extend(response.body.value);

            continuation = response
                .headers
                .get(CONTINUATION_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string);
            debug!(
                identifier,
                received,
                more = continuation.is_some(),
                "Fetched Azure DevOps page"
            );
            if continuation.is_none() {
                break;
            }
        }

        Ok(items)
    }

    async fn project_repos(
        &self,
        org_url: &Url,
        project: &str,
        auth: &Auth,
        identifier: &str,
    ) -> Result<Vec<AzureRepo>, ConnectorError> {
        let url = Self::api_url(
            org_url,
            &format!("{}/_apis/git/repositories", encode_component(project)),
        )?;
        self.list(&url, auth, identifier).await
    }

    async fn org_repos(
        &self,
        host: &str,
        org: &str,
        config: &AzureDevOpsConfig,
        auth: &Auth,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<AzureRepo>, ConnectorError> {
        let org_url = Self::org_url(host, org, config.use_tfs_path)?;
        let projects: Vec<AzureProject> = self
            .list(
                &Self::api_url(&org_url, "_apis/projects")?,
                auth,
                &format!("azuredevops:org:{}", org),
            )
            .await?;

        let mut repos = Vec::new();
        for project in projects {
            let Some(project_id) = project.id.as_deref() else {
                warn!(org, project = %project.name, "Skipping Azure DevOps project without an id");
                continue;
            };
            let listed = self
                .project_repos(
                    &org_url,
                    project_id,
                    auth,
                    &format!("azuredevops:project:{}/{}", org, project.name),
                )
                .await;
            repos.extend(warn_if_missing(listed, warnings, || {
                format!("Project {}/{} not found or no access", org, project.name)
            })?);
        }
        Ok(repos)
    }

    fn keep(found: &Found, exclude_projects: &GlobSet, filter: &RepoFilter, disabled: bool) -> bool {
        let repo = &found.repo;
        let qualified = format!("{}/{}", repo.project.name, repo.name);

        let reason = if repo.remote_url.is_none() {
            Some("no remote url")
        } else if disabled && repo.is_disabled {
            Some("`exclude.disabled` is true")
        } else if exclude_projects.is_match(&repo.project.name) {
            Some("matched by `exclude.projects`")
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(repo = %qualified, reason, "Excluding Azure DevOps repository");
            return false;
        }

        filter.keep(&Candidate {
            qualified_name: &qualified,
            is_fork: repo.is_fork,
            is_archived: false,
            topics: &[],
            size_bytes: repo.size.filter(|size| *size > 0),
        })
    }

    fn to_descriptor(
        found: Found,
        clone_url: String,
        host: &str,
        host_name: &str,
        config: &AzureDevOpsConfig,
    ) -> RepoDescriptor {
        let Found { org, repo } = found;
        let name = format!("{}/{}/{}/{}", host_name, org, repo.project.name, repo.name);
        let public = repo
            .project
            .visibility
            .as_deref()
            .is_some_and(|visibility| visibility.eq_ignore_ascii_case("public"));

        let mut git_config = vec![
            ("zoekt.web-url-type", CODE_HOST_TYPE.to_string()),
            ("zoekt.name", name.clone()),
            ("zoekt.archived", marshal_bool(repo.is_disabled)),
            ("zoekt.fork", marshal_bool(repo.is_fork)),
            ("zoekt.public", marshal_bool(public)),
        ];
        if let Some(web_url) = &repo.web_url {
            git_config.push(("zoekt.web-url", web_url.clone()));
        }

        RepoDescriptor {
            external_id: repo.id,
            external_code_host_type: CODE_HOST_TYPE.to_string(),
            external_code_host_url: host.to_string(),
            name,
            clone_url,
            web_url: repo.web_url,
            image_url: None,
            is_fork: repo.is_fork,
            is_archived: repo.is_disabled,
            topics: Vec::new(),
            metadata: repo_metadata(git_config, config.revisions.as_ref()),
        }
    }
}

fn split_path<'a, const N: usize>(
    value: &'a str,
    field: &str,
    expected: &str,
) -> Result<[&'a str; N], ConnectorError> {
    let parts: Vec<&str> = value.split('/').collect();
    <[&str; N]>::try_from(parts)
        .ok()
        .filter(|parts| parts.iter().all(|part| !part.is_empty()))
        .ok_or_else(|| {
            ConnectorError::InvalidConfig(format!(
                "`{}` entry '{}' must be formatted as {}",
                field, value, expected
            ))
        })
}

#[async_trait]
impl CodeHostAdapter for AzureDevOpsAdapter {
    fn code_host_type(&self) -> &'static str {
        CODE_HOST_TYPE
    }

    async fn discover(
        &self,
        config: &ConnectionConfig,
        token: Option<&str>,
    ) -> Result<DiscoveryResult, ConnectorError> {
        let ConnectionConfig::AzureDevOps(config) = config else {
            return Err(ConnectorError::InvalidConfig(
                "expected an azuredevops connection config".to_string(),
            ));
        };
        let token = token.ok_or(ConnectorError::MissingToken {
            provider: "Azure DevOps",
        })?;

        let host = host_url(config.url.as_deref(), AZURE_DEVOPS_CLOUD_URL);
        let host_name = hostname(&host)?;
        let auth = Auth::Basic {
            username: String::new(),
            password: token.to_string(),
        };
        let exclude_projects = GlobSet::new(&config.exclude.projects)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        let filter = RepoFilter::new()
            .exclude_names(&config.exclude.repos)?
            .size(config.exclude.size);

        let mut found: Vec<Found> = Vec::new();
        let mut warnings = Vec::new();

        for org in &config.orgs {
            let repos = self
                .org_repos(&host, org, config, &auth, &mut warnings)
                .await;
            let repos = warn_if_missing(repos, &mut warnings, || {
                format!("Organization {} not found or no access", org)
            })?;
            found.extend(repos.into_iter().map(|repo| Found {
                org: org.clone(),
                repo,
            }));
        }

        for entry in &config.projects {
            let [org, project] = split_path::<2>(entry, "projects", "ORG/PROJECT")?;
            let org_url = Self::org_url(&host, org, config.use_tfs_path)?;
            let repos = self
                .project_repos(&org_url, project, &auth, &format!("azuredevops:project:{}", entry))
                .await;
            let repos = warn_if_missing(repos, &mut warnings, || {
                format!("Project {} not found or no access", entry)
            })?;
            found.extend(repos.into_iter().map(|repo| Found {
                org: org.to_string(),
                repo,
            }));
        }

        for entry in &config.repos {
            let [org, project, name] = split_path::<3>(entry, "repos", "ORG/PROJECT/REPO")?;
            let org_url = Self::org_url(&host, org, config.use_tfs_path)?;
            let url = Self::api_url(
                &org_url,
                &format!(
                    "{}/_apis/git/repositories/{}",
                    encode_component(project),
                    encode_component(name)
                ),
            )?;
            let repo = self
                .http
                .get_json::<AzureRepo>(&url, &auth, &format!("azuredevops:repo:{}", entry))
                .await
                .map(|response| vec![response.body]);
            let repos = warn_if_missing(repo, &mut warnings, || {
                format!("Repository {} not found or no access", entry)
            })?;
            found.extend(repos.into_iter().map(|repo| Found {
                org: org.to_string(),
                repo,
            }));
        }

        let discovered = found.len();
        let descriptors: Vec<RepoDescriptor> = found
            .into_iter()
            .filter(|found| Self::keep(found, &exclude_projects, &filter, config.exclude.disabled))
            .filter_map(|found| {
                let clone_url = found.repo.remote_url.clone()?;
                Some(Self::to_descriptor(found, clone_url, &host, &host_name, config))
            })
            .collect();
        let repos = dedup_descriptors(descriptors);

        info!(
            host = %host,
            discovered,
            kept = repos.len(),
            warnings = warnings.len(),
            "Azure DevOps discovery finished"
        );

        Ok(DiscoveryResult { repos, warnings })
    }
}
