//! Gitea adapter
//!
//! Gitea reports the size of a listing in `x-total-count`; pages are fetched
//! until that many repositories have been collected.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::config::{ConnectionConfig, GITEA_CLOUD_URL, GiteaConfig, base_url};
use super::filter::{Candidate, RepoFilter, dedup_descriptors};
use super::http::{Auth, HttpClient, PageGuard, encode_component, header_usize};
use super::trait_::{
    CodeHostAdapter, ConnectorError, DiscoveryResult, RepoDescriptor, warn_if_missing,
};
use super::{host_url, hostname, marshal_bool, repo_metadata};

pub const CODE_HOST_TYPE: &str = "gitea";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct GiteaOwner {
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GiteaRepo {
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
    pub stars_count: Option<u64>,
    #[serde(default)]
    pub forks_count: Option<u64>,
    #[serde(default)]
    pub owner: Option<GiteaOwner>,
}

/// Adapter for gitea.com and self-hosted Gitea/Forgejo.
#[derive(Debug, Clone)]
pub struct GiteaAdapter {
    http: HttpClient,
}

impl GiteaAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    async fn list(
        &self,
        api: &Url,
        path: &str,
        auth: &Auth,
        identifier: &str,
    ) -> Result<Vec<GiteaRepo>, ConnectorError> {
        let base = api
            .join(path)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;

        let mut repos: Vec<GiteaRepo> = Vec::new();
        let mut guard = PageGuard::new(identifier);
        let mut page = 1usize;

        loop {
            let mut url = base.clone();
            url.query_pairs_mut()
                .append_pair("page", &page.to_string())
                .append_pair("limit", &PAGE_SIZE.to_string());
            guard.advance(url.as_str())?;

            let response = self
                .http
                .get_json::<Vec<GiteaRepo>>(&url, auth, identifier)
                .await?;
            let total = header_usize(&response.headers, "x-total-count").ok_or_else(|| {
                ConnectorError::Pagination(format!(
                    "{} response is missing the x-total-count header",
                    identifier
                ))
            })?;

            let received = response.body.len();
            debug!(identifier, page, received, total, "Fetched Gitea page");
            repos.extend(response.body);

            if repos.len() >= total || received == 0 {
                break;
            }
            page += 1;
        }

        Ok(repos)
    }

    fn filter(config: &GiteaConfig) -> Result<RepoFilter, ConnectorError> {
        Ok(RepoFilter::new()
            .exclude_forks(config.exclude.forks)
            .exclude_archived(config.exclude.archived)
            .exclude_names(&config.exclude.repos)?)
    }

    fn to_descriptor(
        repo: GiteaRepo,
        clone_url: String,
        host: &str,
        host_name: &str,
        config: &GiteaConfig,
    ) -> RepoDescriptor {
        let name = format!("{}/{}", host_name, repo.full_name);

        let mut git_config = vec![
            ("zoekt.web-url-type", CODE_HOST_TYPE.to_string()),
            ("zoekt.name", name.clone()),
            (
                "zoekt.gitea-stars",
                repo.stars_count.unwrap_or(0).to_string(),
            ),
            (
                "zoekt.gitea-forks",
                repo.forks_count.unwrap_or(0).to_string(),
            ),
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
            topics: Vec::new(),
            metadata: repo_metadata(git_config, config.revisions.as_ref()),
        }
    }
}

#[async_trait]
impl CodeHostAdapter for GiteaAdapter {
    fn code_host_type(&self) -> &'static str {
        CODE_HOST_TYPE
    }

    async fn discover(
        &self,
        config: &ConnectionConfig,
        token: Option<&str>,
    ) -> Result<DiscoveryResult, ConnectorError> {
        let ConnectionConfig::Gitea(config) = config else {
            return Err(ConnectorError::InvalidConfig(
                "expected a gitea connection config".to_string(),
            ));
        };

        let host = host_url(config.url.as_deref(), GITEA_CLOUD_URL);
        let host_name = hostname(&host)?;
        let api = base_url(&format!("{}/api/v1", host))?;
        let auth = token.map_or(Auth::None, |t| Auth::Token(t.to_string()));
        let filter = Self::filter(config)?;

        let mut found = Vec::new();
        let mut warnings = Vec::new();

        for org in &config.orgs {
            let repos = self
                .list(
                    &api,
                    &format!("orgs/{}/repos", encode_component(org)),
                    &auth,
                    &format!("gitea:org:{}", org),
                )
                .await;
            found.extend(warn_if_missing(repos, &mut warnings, || {
                format!("Organization {} not found or no access", org)
            })?);
        }

        for user in &config.users {
            let repos = self
                .list(
                    &api,
                    &format!("users/{}/repos", encode_component(user)),
                    &auth,
                    &format!("gitea:user:{}", user),
                )
                .await;
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
                .get_json::<GiteaRepo>(&url, &auth, &format!("gitea:repo:{}", full_name))
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
                let keep = filter.keep(&Candidate {
                    qualified_name: &repo.full_name,
                    is_fork: repo.fork,
                    is_archived: repo.archived,
                    topics: &[],
                    size_bytes: None,
                });
                keep.then(|| Self::to_descriptor(repo, clone_url, &host, &host_name, config))
            })
            .collect();
        let repos = dedup_descriptors(descriptors);

        info!(
            host = %host,
            discovered,
            kept = repos.len(),
            warnings = warnings.len(),
            "Gitea discovery finished"
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

    fn adapter() -> GiteaAdapter {
        GiteaAdapter::new(HttpClient::new(RetryingFetcher::default()).unwrap())
    }

    fn repo(id: u64, full_name: &str, fork: bool) -> serde_json::Value {
        json!({
            "id": id,
            "full_name": full_name,
            "clone_url": format!("https://gitea.example.com/{}.git", full_name),
            "html_url": format!("https://gitea.example.com/{}", full_name),
            "fork": fork,
            "archived": false,
            "private": false
        })
    }

    #[tokio::test]
    async fn paginates_by_total_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/orgs/acme/repos"))
            .and(query_param("page", "1"))
            .and(header("authorization", "token gt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-total-count", "3")
                    .set_body_json(json!([repo(1, "acme/a", false), repo(2, "acme/b", true)])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/orgs/acme/repos"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-total-count", "3")
                    .set_body_json(json!([repo(3, "acme/c", false)])),
            )
            .mount(&server)
            .await;

        let config = ConnectionConfig::parse(
            &json!({
                "type": "gitea",
                "url": server.uri(),
                "orgs": ["acme"],
                "exclude": { "forks": true }
            }),
            "gitea",
        )
        .unwrap();

        let result = adapter().discover(&config, Some("gt")).await.unwrap();

        let ids: Vec<_> = result.repos.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn missing_total_count_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/bob/repos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([repo(
                1, "bob/a", false
            )])))
            .expect(1)
            .mount(&server)
            .await;

        let config = ConnectionConfig::parse(
            &json!({ "type": "gitea", "url": server.uri(), "users": ["bob"] }),
            "gitea",
        )
        .unwrap();

        let err = adapter().discover(&config, None).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Pagination(_)));
    }

    #[tokio::test]
    async fn unknown_org_is_a_warning() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/orgs/nobody/repos"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = ConnectionConfig::parse(
            &json!({ "type": "gitea", "url": server.uri(), "orgs": ["nobody"] }),
            "gitea",
        )
        .unwrap();

        let result = adapter().discover(&config, None).await.unwrap();
        assert!(result.repos.is_empty());
        assert_eq!(
            result.warnings,
            vec!["Organization nobody not found or no access".to_string()]
        );
    }
}
