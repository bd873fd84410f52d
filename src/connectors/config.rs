//! Connection configuration
//!
//! The JSON stored in `connections.config`, tagged by `type`. Each provider
//! variant carries its inclusion lists, an `exclude` block and optional
//! revision globs.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::trait_::ConnectorError;

pub const GITHUB_CLOUD_URL: &str = "https://github.com";
pub const GITLAB_CLOUD_URL: &str = "https://gitlab.com";
pub const GITEA_CLOUD_URL: &str = "https://gitea.com";
pub const BITBUCKET_CLOUD_URL: &str = "https://bitbucket.org";
pub const AZURE_DEVOPS_CLOUD_URL: &str = "https://dev.azure.com";

/// Where a connection token comes from.
///
/// Literal strings deserialize so that they can be rejected with a
/// dedicated error instead of a generic parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenConfig {
    Secret { secret: String },
    Env { env: String },
    Literal(String),
}

/// Branch and tag globs selecting which refs are indexed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// Inclusive byte bounds on the provider-reported repository size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubExclude {
    #[serde(default)]
    pub forks: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub size: Option<SizeRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubConfig {
    #[serde(default)]
    pub token: Option<TokenConfig>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub orgs: Vec<String>,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub exclude: GithubExclude,
    #[serde(default)]
    pub revisions: Option<RevisionsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitlabExclude {
    #[serde(default)]
    pub forks: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitlabConfig {
    #[serde(default)]
    pub token: Option<TokenConfig>,
    #[serde(default)]
    pub url: Option<String>,
    /// Every project visible to the token; ignored on gitlab.com
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub exclude: GitlabExclude,
    #[serde(default)]
    pub revisions: Option<RevisionsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiteaExclude {
    #[serde(default)]
    pub forks: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub repos: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiteaConfig {
    #[serde(default)]
    pub token: Option<TokenConfig>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub orgs: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub exclude: GiteaExclude,
    #[serde(default)]
    pub revisions: Option<RevisionsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GerritExclude {
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GerritConfig {
    pub url: String,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub exclude: GerritExclude,
    #[serde(default)]
    pub revisions: Option<RevisionsConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitbucketDeployment {
    #[default]
    Cloud,
    Server,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitbucketExclude {
    #[serde(default)]
    pub forks: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub repos: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitbucketConfig {
    /// Username paired with an app password on Bitbucket Cloud
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub token: Option<TokenConfig>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub deployment_type: BitbucketDeployment,
    #[serde(default)]
    pub workspaces: Vec<String>,
    /// `WORKSPACE/PROJECT_KEY` on cloud, `PROJECT_KEY` on server
    #[serde(default)]
    pub projects: Vec<String>,
    /// `workspace/repo` on cloud, `PROJECT_KEY/repo` on server
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub exclude: BitbucketExclude,
    #[serde(default)]
    pub revisions: Option<RevisionsConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AzureDevOpsDeployment {
    #[default]
    Cloud,
    Server,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureDevOpsExclude {
    #[serde(default)]
    pub disabled: bool,
    /// Globs over `project/repo`
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub size: Option<SizeRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureDevOpsConfig {
    /// Personal access token; required
    #[serde(default)]
    pub token: Option<TokenConfig>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub deployment_type: AzureDevOpsDeployment,
    /// Put `/tfs` before the collection, for TFS 2018 and older
    #[serde(default)]
    pub use_tfs_path: bool,
    /// Organizations on cloud, collections on server
    #[serde(default)]
    pub orgs: Vec<String>,
    /// `ORG/PROJECT`
    #[serde(default)]
    pub projects: Vec<String>,
    /// `ORG/PROJECT/REPO`
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub exclude: AzureDevOpsExclude,
    #[serde(default)]
    pub revisions: Option<RevisionsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericGitConfig {
    pub url: String,
    #[serde(default)]
    pub revisions: Option<RevisionsConfig>,
}

/// Provider configuration of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Github(GithubConfig),
    Gitlab(GitlabConfig),
    Gitea(GiteaConfig),
    Gerrit(GerritConfig),
    Bitbucket(BitbucketConfig),
    AzureDevOps(AzureDevOpsConfig),
    Git(GenericGitConfig),
}

impl ConnectionConfig {
    /// Parse the stored JSON, tolerating a missing `type` when the connection
    /// row records it separately.
    pub fn parse(value: &JsonValue, connection_type: &str) -> Result<Self, ConnectorError> {
        let mut value = value.clone();
        if let Some(obj) = value.as_object_mut() {
            obj.entry("type")
                .or_insert_with(|| JsonValue::String(connection_type.to_string()));
        }

        let config: Self = serde_json::from_value(value)
            .map_err(|err| ConnectorError::InvalidConfig(err.to_string()))?;

        if config.code_host_type() != connection_type {
            return Err(ConnectorError::InvalidConfig(format!(
                "config type '{}' does not match connection type '{}'",
                config.code_host_type(),
                connection_type
            )));
        }

        Ok(config)
    }

    pub fn code_host_type(&self) -> &'static str {
        match self {
            ConnectionConfig::Github(_) => "github",
            ConnectionConfig::Gitlab(_) => "gitlab",
            ConnectionConfig::Gitea(_) => "gitea",
            ConnectionConfig::Gerrit(_) => "gerrit",
            ConnectionConfig::Bitbucket(_) => "bitbucket",
            ConnectionConfig::AzureDevOps(_) => "azuredevops",
            ConnectionConfig::Git(_) => "git",
        }
    }

    pub fn token(&self) -> Option<&TokenConfig> {
        match self {
            ConnectionConfig::Github(c) => c.token.as_ref(),
            ConnectionConfig::Gitlab(c) => c.token.as_ref(),
            ConnectionConfig::Gitea(c) => c.token.as_ref(),
            ConnectionConfig::Bitbucket(c) => c.token.as_ref(),
            ConnectionConfig::AzureDevOps(c) => c.token.as_ref(),
            ConnectionConfig::Gerrit(_) | ConnectionConfig::Git(_) => None,
        }
    }

    pub fn revisions(&self) -> Option<&RevisionsConfig> {
        match self {
            ConnectionConfig::Github(c) => c.revisions.as_ref(),
            ConnectionConfig::Gitlab(c) => c.revisions.as_ref(),
            ConnectionConfig::Gitea(c) => c.revisions.as_ref(),
            ConnectionConfig::Gerrit(c) => c.revisions.as_ref(),
            ConnectionConfig::Bitbucket(c) => c.revisions.as_ref(),
            ConnectionConfig::AzureDevOps(c) => c.revisions.as_ref(),
            ConnectionConfig::Git(c) => c.revisions.as_ref(),
        }
    }
}

/// Parse a base URL, appending a trailing slash so relative joins keep the path.
pub fn base_url(raw: &str) -> Result<url::Url, ConnectorError> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    url::Url::parse(&normalized)
        .map_err(|err| ConnectorError::InvalidConfig(format!("invalid url '{}': {}", raw, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_github_config_with_exclusions() {
        let config = ConnectionConfig::parse(
            &json!({
                "type": "github",
                "token": { "secret": "gh-token" },
                "orgs": ["acme"],
                "exclude": {
                    "forks": true,
                    "repos": ["acme/legacy-*"],
                    "size": { "max": 1000000 }
                },
                "revisions": { "branches": ["main", "release/*"] }
            }),
            "github",
        )
        .unwrap();

        let ConnectionConfig::Github(github) = &config else {
            panic!("expected github config");
        };
        assert_eq!(github.orgs, vec!["acme"]);
        assert!(github.exclude.forks);
        assert!(!github.exclude.archived);
        assert_eq!(github.exclude.size.unwrap().max, Some(1_000_000));
        assert_eq!(
            config.token(),
            Some(&TokenConfig::Secret {
                secret: "gh-token".to_string()
            })
        );
        assert_eq!(
            config.revisions().unwrap().branches.as_deref(),
            Some(&["main".to_string(), "release/*".to_string()][..])
        );
    }

    #[test]
    fn missing_type_is_taken_from_connection_row() {
        let config =
            ConnectionConfig::parse(&json!({ "url": "https://review.example.com" }), "gerrit")
                .unwrap();
        assert_eq!(config.code_host_type(), "gerrit");
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let err = ConnectionConfig::parse(&json!({ "type": "gitlab" }), "github").unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidConfig(_)));
    }

    #[test]
    fn token_variants() {
        let env: TokenConfig = serde_json::from_value(json!({ "env": "GITLAB_TOKEN" })).unwrap();
        assert_eq!(
            env,
            TokenConfig::Env {
                env: "GITLAB_TOKEN".to_string()
            }
        );

        let literal: TokenConfig = serde_json::from_value(json!("glpat-123")).unwrap();
        assert!(matches!(literal, TokenConfig::Literal(_)));
    }

    #[test]
    fn bitbucket_defaults_to_cloud() {
        let config = ConnectionConfig::parse(
            &json!({ "type": "bitbucket", "workspaces": ["org"] }),
            "bitbucket",
        )
        .unwrap();
        let ConnectionConfig::Bitbucket(bitbucket) = config else {
            panic!("expected bitbucket config");
        };
        assert_eq!(bitbucket.deployment_type, BitbucketDeployment::Cloud);
    }

    #[test]
    fn parses_azure_devops_config() {
        let config = ConnectionConfig::parse(
            &json!({
                "type": "azuredevops",
                "token": { "env": "ADO_PAT" },
                "deploymentType": "server",
                "useTfsPath": true,
                "orgs": ["DefaultCollection"],
                "exclude": { "disabled": true, "projects": ["Sandbox*"] }
            }),
            "azuredevops",
        )
        .unwrap();
        assert_eq!(config.code_host_type(), "azuredevops");

        let ConnectionConfig::AzureDevOps(azure) = config else {
            panic!("expected azure devops config");
        };
        assert_eq!(azure.deployment_type, AzureDevOpsDeployment::Server);
        assert!(azure.use_tfs_path);
        assert!(azure.exclude.disabled);
        assert_eq!(azure.exclude.projects, vec!["Sandbox*"]);
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let url = base_url("https://review.example.com/gerrit").unwrap();
        assert_eq!(url.as_str(), "https://review.example.com/gerrit/");
        assert_eq!(
            url.join("projects/").unwrap().as_str(),
            "https://review.example.com/gerrit/projects/"
        );
    }
}
