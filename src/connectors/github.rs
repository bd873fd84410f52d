//! GitHub adapter
//!
//! Discovers repositories of users, organizations and explicitly listed
//! repos on github.com or GitHub Enterprise, following `Link` pagination.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::config::{ConnectionConfig, GITHUB_CLOUD_URL, GithubConfig, base_url};
use super::filter::{Candidate, RepoFilter, dedup_descriptors};
use super::http::{Auth, HttpClient, PageGuard, next_link};
use super::trait_::{
    CodeHostAdapter, ConnectorError, DiscoveryResult, RepoDescriptor, warn_if_missing,
};
use super::{host_url, hostname, marshal_bool, repo_metadata};

pub const CODE_HOST_TYPE: &str = "github";
const CLOUD_API_BASE: &str = "https://api.github.com/";

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubOwner {
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Subset of the GitHub repository payload the adapter reads.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRepo {
    pub id: u64,
    pub full_name: String,
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Size in kilobytes
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub stargazers_count: Option<u64>,
    #[serde(default)]
    pub watchers_count: Option<u64>,
    #[serde(default)]
    pub subscribers_count: Option<u64>,
    #[serde(default)]
    pub forks_count: Option<u64>,
    #[serde(default)]
    pub owner: Option<GitHubOwner>,
}

/// Adapter for github.com and GitHub Enterprise Server.
#[derive(Debug, Clone)]
pub struct GitHubAdapter {
    http: HttpClient,
}

impl GitHubAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    fn api_base(host: &str) -> Result<Url, ConnectorError> {
        if hostname(host)? == "github.com" {
            base_url(CLOUD_API_BASE)
        } else {
            base_url(&format!("{}/api/v3", host))
        }
    }

    async fn list(
        &self,
        first: Url,
        auth: &Auth,
        identifier: &str,
    ) -> Result<Vec<GitHubRepo>, ConnectorError> {
        let mut repos = Vec::new();
        let mut guard = PageGuard::new(identifier);
        let mut next = Some(first);

        while let Some(url) = next.take() {
            guard.advance(url.as_str())?;
            let page = self
                .http
                .get_json::<Vec<GitHubRepo>>(&url, auth, identifier)
                .await?;
            debug!(identifier, count = page.body.len(), "Fetched GitHub page");
            repos.extend(page.body);

            next = match next_link(&page.headers) {
                Some(link) => Some(Url::parse(&link).map_err(|err| {
                    ConnectorError::Pagination(format!("invalid next link '{}': {}", link, err))
                })?),
                None => None,
            };
        }

        Ok(repos)
    }

    fn listing_url(api: &Url, path: &str) -> Result<Url, ConnectorError> {
        let mut url = api
            .join(path)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
        url.query_pairs_mut().append_pair("per_page", "100");
        Ok(url)
    }

    fn filter(config: &GithubConfig) -> Result<RepoFilter, ConnectorError> {
        Ok(RepoFilter::new()
            .exclude_forks(config.exclude.forks)
            .exclude_archived(config.exclude.archived)
            .exclude_names(&config.exclude.repos)?
            .exclude_topics(&config.exclude.topics)?
            .include_topics(&config.topics)?
            .size(config.exclude.size))
    }

    fn to_descriptor(
        repo: GitHubRepo,
        clone_url: String,
        host: &str,
        host_name: &str,
        config: &GithubConfig,
    ) -> RepoDescriptor {
        let name = format!("{}/{}", host_name, repo.full_name);
        let count = |value: Option<u64>| value.unwrap_or(0).to_string();

        let mut git_config = vec![
            ("zoekt.web-url-type", CODE_HOST_TYPE.to_string()),
            ("zoekt.name", name.clone()),
            ("zoekt.github-stars", count(repo.stargazers_count)),
            ("zoekt.github-watchers", count(repo.watchers_count)),
            ("zoekt.github-subscribers", count(repo.subscribers_count)),
            ("zoekt.github-forks", count(repo.forks_count)),
            ("zoekt.archived", marshal_bool(repo.archived)),
            ("zoekt.fork", marshal_bool(repo.fork)),
            ("zoekt.public", marshal_bool(!repo.private)),
        ];
        if let Some(web_url) = &repo.html_url {
            git_config.push(("zoekt.web-url", web_url.clone()));
        }

        RepoDescriptor {
            external_id: repo.id.to_string(),
            external_code_host_type: CODE_HOST_TYPE.to_string(),
            external_code_host_url: host.to_string(),
            name,
            clone_url,
            web_url: repo.html_url,
            image_url: repo.owner.and_then(|owner| owner.avatar_url),
            is_fork: repo.fork,
            is_archived: repo.archived,
            topics: repo.topics,
            metadata: repo_metadata(git_config, config.revisions.as_ref()),
        }
    }
}

#[async_trait]
impl CodeHostAdapter for GitHubAdapter {
    fn code_host_type(&self) -> &'static str {
        CODE_HOST_TYPE
    }

    async fn discover(
        &self,
        config: &ConnectionConfig,
        token: Option<&str>,
    ) -> Result<DiscoveryResult, ConnectorError> {
        let ConnectionConfig::Github(config) = config else {
            return Err(ConnectorError::InvalidConfig(
                "expected a github connection config".to_string(),
            ));
        };

        let host = host_url(config.url.as_deref(), GITHUB_CLOUD_URL);
        let host_name = hostname(&host)?;
        let api = Self::api_base(&host)?;
        let auth = Auth::bearer(token);
        let filter = Self::filter(config)?;

        let mut found = Vec::new();
        let mut warnings = Vec::new();

        for org in &config.orgs {
            let url = Self::listing_url(&api, &format!("orgs/{}/repos", org))?;
            let repos = self.list(url, &auth, &format!("github:org:{}", org)).await;
            found.extend(warn_if_missing(repos, &mut warnings, || {
                format!("Organization {} not found or no access", org)
            })?);
        }

        for user in &config.users {
            let url = Self::listing_url(&api, &format!("users/{}/repos", user))?;
            let repos = self.list(url, &auth, &format!("github:user:{}", user)).await;
            found.extend(warn_if_missing(repos, &mut warnings, || {
                format!("User {} not found or no access", user)
            })?);
        }

        for full_name in &config.repos {
            let url = api
                .join(&format!("repos/{}", full_name))
                .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;
            let repo = self
                .http
                .get_json::<GitHubRepo>(&url, &auth, &format!("github:repo:{}", full_name))
                .await
                .map(|response| vec![response.body]);
            found.extend(warn_if_missing(repo, &mut warnings, || {
                format!("Repository {} not found or no access", full_name)
            })?);
        }

        let discovered = found.len();
        let descriptors: Vec<RepoDescriptor> = found
            .into_iter()
            .filter_map(|repo| {
                let clone_url = repo.clone_url.clone()?;
                let candidate = Candidate {
                    qualified_name: &repo.full_name,
                    is_fork: repo.fork,
                    is_archived: repo.archived,
                    topics: &repo.topics,
                    size_bytes: repo.size.map(|kb| kb * 1000),
                };
                filter
                    .keep(&candidate)
                    .then(|| Self::to_descriptor(repo, clone_url, &host, &host_name, config))
            })
            .collect();
        let repos = dedup_descriptors(descriptors);

        info!(
            host = %host,
            discovered,
            kept = repos.len(),
            warnings = warnings.len(),
            "GitHub discovery finished"
        );

        Ok(DiscoveryResult { repos, warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryingFetcher;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter() -> GitHubAdapter {
        GitHubAdapter::new(HttpClient::new(RetryingFetcher::default()).unwrap())
    }

    fn repo_json(id: u64, full_name: &str, extra: serde_json::Value) -> serde_json::Value {
        let mut repo = json!({
            "id": id,
            "full_name": full_name,
            "clone_url": format!("https://github.example.com/{}.git", full_name),
            "html_url": format!("https://github.example.com/{}", full_name),
            "fork": false,
            "archived": false,
            "private": false,
            "topics": [],
            "size": 10,
            "stargazers_count": 3,
            "owner": { "avatar_url": "https://avatars.example.com/u/1" }
        });
        if let (Some(base), Some(extra)) = (repo.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        repo
    }

    fn config(server: &MockServer, value: serde_json::Value) -> ConnectionConfig {
        let mut value = value;
        value["type"] = json!("github");
        value["url"] = json!(server.uri());
        ConnectionConfig::parse(&value, "github").unwrap()
    }

    #[tokio::test]
    async fn discovers_org_repos_across_pages_and_applies_exclusions() {
        let server = MockServer::start().await;
        let next = format!("{}/api/v3/orgs/acme/repos?per_page=100&page=2", server.uri());

        Mock::given(method("GET"))
            .and(path("/api/v3/orgs/acme/repos"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                repo_json(3, "acme/old", json!({ "archived": true })),
                repo_json(4, "acme/huge", json!({ "size": 5000 })),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/orgs/acme/repos"))
            .and(header("authorization", "Bearer ghp_test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", format!("<{}>; rel=\"next\"", next).as_str())
                    .set_body_json(json!([
                        repo_json(1, "acme/api", json!({ "topics": ["rust"] })),
                        repo_json(2, "acme/fork", json!({ "fork": true })),
                    ])),
            )
            .mount(&server)
            .await;

        let config = config(
            &server,
            json!({
                "orgs": ["acme"],
                "exclude": { "forks": true, "archived": true, "size": { "max": 1000000 } },
                "revisions": { "branches": ["main"] }
            }),
        );

        let result = adapter().discover(&config, Some("ghp_test")).await.unwrap();

        let names: Vec<_> = result.repos.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["127.0.0.1/acme/api"]);
        assert!(result.warnings.is_empty());

        let api = &result.repos[0];
        assert_eq!(api.external_id, "1");
        assert_eq!(api.external_code_host_url, server.uri());
        assert_eq!(api.topics, vec!["rust"]);
        assert_eq!(
            api.metadata.git_config.get("zoekt.web-url-type").map(String::as_str),
            Some("github")
        );
        assert_eq!(
            api.metadata.git_config.get("zoekt.github-stars").map(String::as_str),
            Some("3")
        );
        assert_eq!(api.metadata.branches, Some(vec!["main".to_string()]));
        assert_eq!(
            api.image_url.as_deref(),
            Some("https://avatars.example.com/u/1")
        );
    }

    #[tokio::test]
    async fn missing_targets_become_warnings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/users/ghost/repos"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/repos/acme/api"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(repo_json(1, "acme/api", json!({}))),
            )
            .mount(&server)
            .await;

        let config = config(&server, json!({ "users": ["ghost"], "repos": ["acme/api"] }));

        let result = adapter().discover(&config, None).await.unwrap();

        assert_eq!(result.repos.len(), 1);
        assert_eq!(
            result.warnings,
            vec!["User ghost not found or no access".to_string()]
        );
    }

    #[tokio::test]
    async fn unauthorized_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/orgs/acme/repos"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let config = config(&server, json!({ "orgs": ["acme"] }));
        let err = adapter().discover(&config, Some("bad")).await.unwrap_err();

        assert!(matches!(err, ConnectorError::Http { status: 401, .. }));
    }

    #[tokio::test]
    async fn topic_inclusion_and_duplicates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/orgs/acme/repos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                repo_json(1, "acme/api", json!({ "topics": ["Backend"] })),
                repo_json(2, "acme/web", json!({ "topics": ["frontend"] })),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/repos/acme/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(repo_json(
                1,
                "acme/api",
                json!({ "topics": ["backend"] }),
            )))
            .mount(&server)
            .await;

        let config = config(
            &server,
            json!({ "orgs": ["acme"], "repos": ["acme/api"], "topics": ["back*"] }),
        );

        let result = adapter().discover(&config, None).await.unwrap();

        assert_eq!(result.repos.len(), 1);
        assert_eq!(result.repos[0].external_id, "1");
        assert_eq!(result.repos[0].topics, vec!["backend"]);
    }

    #[tokio::test]
    async fn rejects_foreign_config() {
        let config = ConnectionConfig::parse(&json!({ "type": "git", "url": "file:///tmp/x" }), "git")
            .unwrap();
        let err = adapter().discover(&config, None).await.unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidConfig(_)));
    }
}
