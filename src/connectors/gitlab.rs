//! GitLab adapter
//!
//! Discovers projects of groups (including subgroups), users and explicitly
//! listed projects. `all: true` lists every visible project on self-managed
//! instances and is ignored on gitlab.com.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::config::{ConnectionConfig, GITLAB_CLOUD_URL, GitlabConfig, base_url};
use super::filter::{Candidate, RepoFilter, dedup_descriptors};
use super::http::{Auth, HttpClient, PageGuard, encode_component, next_link};
use super::trait_::{
    CodeHostAdapter, ConnectorError, DiscoveryResult, RepoDescriptor, warn_if_missing,
};
use super::{host_url, hostname, marshal_bool, repo_metadata};

pub const CODE_HOST_TYPE: &str = "gitlab";
const CLOUD_HOSTNAME: &str = "gitlab.com";

#[derive(Debug, Clone, Deserialize)]
pub struct GitLabProject {
    pub id: u64,
    pub path_with_namespace: String,
    pub http_url_to_repo: String,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub forked_from_project: Option<serde_json::Value>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub star_count: Option<u64>,
    #[serde(default)]
    pub forks_count: Option<u64>,
}

impl GitLabProject {
    pub fn is_fork(&self) -> bool {
        self.forked_from_project.is_some()
    }
}

/// Adapter for gitlab.com and self-managed GitLab.
#[derive(Debug, Clone)]
pub struct GitLabAdapter {
    http: HttpClient,
}

impl GitLabAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    async fn list(
        &self,
        api: &Url,
        path: &str,
        extra_query: &[(&str, &str)],
        auth: &Auth,
        identifier: &str,
    ) -> Result<Vec<GitLabProject>, ConnectorError> {
        let mut first = api
            .join(path)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        {
            let mut query = first.query_pairs_mut();
            query.append_pair("per_page", "100");
            for (key, value) in extra_query {
                query.append_pair(key, value);
            }
        }

        let mut projects = Vec::new();
        let mut guard = PageGuard::new(identifier);
        let mut next = Some(first);

        while let Some(url) = next.take() {
            guard.advance(url.as_str())?;
            let page = self
                .http
                .get_json::<Vec<GitLabProject>>(&url, auth, identifier)
                .await?;
            debug!(identifier, count = page.body.len(), "Fetched GitLab page");
            projects.extend(page.body);

            next = match next_link(&page.headers) {
                Some(link) => Some(Url::parse(&link).map_err(|err| {
                    ConnectorError::Pagination(format!("invalid next link '{}': {}", link, err))
                })?),
                None => None,
            };
        }

        Ok(projects)
    }

    fn filter(config: &GitlabConfig) -> Result<RepoFilter, ConnectorError> {
        Ok(RepoFilter::new()
            .exclude_forks(config.exclude.forks)
            .exclude_archived(config.exclude.archived)
            .exclude_names(&config.exclude.projects)?
            .exclude_topics(&config.exclude.topics)?
            .include_topics(&config.topics)?)
    }

    fn to_descriptor(
        project: GitLabProject,
        host: &str,
        host_name: &str,
        config: &GitlabConfig,
    ) -> RepoDescriptor {
        let name = format!("{}/{}", host_name, project.path_with_namespace);
        let is_fork = project.is_fork();
        let public = project.visibility.as_deref() == Some("public");

        let mut git_config = vec![
            ("zoekt.web-url-type", CODE_HOST_TYPE.to_string()),
            ("zoekt.name", name.clone()),
            (
                "zoekt.gitlab-stars",
                project.star_count.unwrap_or(0).to_string(),
            ),
            (
                "zoekt.gitlab-forks",
                project.forks_count.unwrap_or(0).to_string(),
            ),
            ("zoekt.archived", marshal_bool(project.archived)),
            ("zoekt.fork", marshal_bool(is_fork)),
            ("zoekt.public", marshal_bool(public)),
        ];
        if let Some(web_url) = &project.web_url {
            git_config.push(("zoekt.web-url", web_url.clone()));
        }

        RepoDescriptor {
            external_id: project.id.to_string(),
            external_code_host_type: CODE_HOST_TYPE.to_string(),
            external_code_host_url: host.to_string(),
            name,
            clone_url: project.http_url_to_repo,
            web_url: project.web_url,
            image_url: project.avatar_url,
            is_fork,
            is_archived: project.archived,
            topics: project.topics,
            metadata: repo_metadata(git_config, config.revisions.as_ref()),
        }
    }
}

#[async_trait]
impl CodeHostAdapter for GitLabAdapter {
    fn code_host_type(&self) -> &'static str {
        CODE_HOST_TYPE
    }

    async fn discover(
        &self,
        config: &ConnectionConfig,
        token: Option<&str>,
    ) -> Result<DiscoveryResult, ConnectorError> {
        let ConnectionConfig::Gitlab(config) = config else {
            return Err(ConnectorError::InvalidConfig(
                "expected a gitlab connection config".to_string(),
            ));
        };

        let host = host_url(config.url.as_deref(), GITLAB_CLOUD_URL);
        let host_name = hostname(&host)?;
        let api = base_url(&format!("{}/api/v4", host))?;
        let auth = Auth::bearer(token);
        let filter = Self::filter(config)?;

        let mut found = Vec::new();
        let mut warnings = Vec::new();

        if config.all {
            if host_name == CLOUD_HOSTNAME {
                warn!("Ignoring `all: true` for {}", CLOUD_HOSTNAME);
            } else {
                found.extend(
                    self.list(&api, "projects", &[], &auth, "gitlab:all")
                        .await?,
                );
            }
        }

        for group in &config.groups {
            let projects = self
                .list(
                    &api,
                    &format!("groups/{}/projects", encode_component(group)),
                    &[("include_subgroups", "true")],
                    &auth,
                    &format!("gitlab:group:{}", group),
                )
                .await;
            found.extend(warn_if_missing(projects, &mut warnings, || {
                format!("Group {} not found or no access", group)
            })?);
        }

        for user in &config.users {
            let projects = self
                .list(
                    &api,
                    &format!("users/{}/projects", encode_component(user)),
                    &[],
                    &auth,
                    &format!("gitlab:user:{}", user),
                )
                .await;
            found.extend(warn_if_missing(projects, &mut warnings, || {
                format!("User {} not found or no access", user)
            })?);
        }

        for project in &config.projects {
            let url = api
                .join(&format!("projects/{}", encode_component(project)))
                .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
            let fetched = self
                .http
                .get_json::<GitLabProject>(&url, &auth, &format!("gitlab:project:{}", project))
                .await
                .map(|response| vec![response.body]);
            found.extend(warn_if_missing(fetched, &mut warnings, || {
                format!("Project {} not found or no access", project)
            })?);
        }

        let discovered = found.len();
        let descriptors: Vec<RepoDescriptor> = found
            .into_iter()
            .filter(|project| {
                filter.keep(&Candidate {
                    qualified_name: &project.path_with_namespace,
                    is_fork: project.is_fork(),
                    is_archived: project.archived,
                    topics: &project.topics,
                    size_bytes: None,
                })
            })
            .map(|project| Self::to_descriptor(project, &host, &host_name, config))
            .collect();
        let repos = dedup_descriptors(descriptors);

        info!(
            host = %host,
            discovered,
            kept = repos.len(),
            warnings = warnings.len(),
            "GitLab discovery finished"
        );

        Ok(DiscoveryResult { repos, warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryingFetcher;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter() -> GitLabAdapter {
        GitLabAdapter::new(HttpClient::new(RetryingFetcher::default()).unwrap())
    }

    fn project(id: u64, path_with_namespace: &str, extra: serde_json::Value) -> serde_json::Value {
        let mut value = json!({
            "id": id,
            "path_with_namespace": path_with_namespace,
            "http_url_to_repo": format!("https://gitlab.example.com/{}.git", path_with_namespace),
            "web_url": format!("https://gitlab.example.com/{}", path_with_namespace),
            "archived": false,
            "topics": [],
            "visibility": "public"
        });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            for (key, field) in extra {
                base.insert(key.clone(), field.clone());
            }
        }
        value
    }

    #[tokio::test]
    async fn group_projects_include_subgroups_and_respect_exclusions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/groups/platform/projects"))
            .and(query_param("include_subgroups", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                project(1, "platform/api", json!({})),
                project(2, "platform/infra/terraform", json!({})),
                project(3, "platform/archive-2019", json!({ "archived": true })),
                project(4, "platform/forked", json!({ "forked_from_project": { "id": 99 } })),
                project(5, "platform/legacy", json!({ "topics": ["Deprecated"] })),
            ])))
            .mount(&server)
            .await;

        let config = ConnectionConfig::parse(
            &json!({
                "type": "gitlab",
                "url": server.uri(),
                "groups": ["platform"],
                "exclude": {
                    "archived": true,
                    "forks": true,
                    "projects": ["platform/infra/**"],
                    "topics": ["deprecated"]
                }
            }),
            "gitlab",
        )
        .unwrap();

        let result = adapter().discover(&config, Some("glpat")).await.unwrap();

        let names: Vec<_> = result.repos.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["127.0.0.1/platform/api"]);
        assert_eq!(
            result.repos[0]
                .metadata
                .git_config
                .get("zoekt.public")
                .map(String::as_str),
            Some("1")
        );
    }

    #[tokio::test]
    async fn nested_project_paths_are_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/group%2Fsub%2Fapp"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(project(7, "group/sub/app", json!({}))),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/group%2Fgone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = ConnectionConfig::parse(
            &json!({
                "type": "gitlab",
                "url": server.uri(),
                "projects": ["group/sub/app", "group/gone"]
            }),
            "gitlab",
        )
        .unwrap();

        let result = adapter().discover(&config, None).await.unwrap();

        assert_eq!(result.repos.len(), 1);
        assert_eq!(result.repos[0].external_id, "7");
        assert_eq!(
            result.warnings,
            vec!["Project group/gone not found or no access".to_string()]
        );
    }

    #[tokio::test]
    async fn all_is_ignored_on_gitlab_com() {
        let config = ConnectionConfig::parse(&json!({ "type": "gitlab", "all": true }), "gitlab")
            .unwrap();

        let result = adapter().discover(&config, None).await.unwrap();

        assert!(result.repos.is_empty());
        assert!(result.warnings.is_empty());
    }
}
