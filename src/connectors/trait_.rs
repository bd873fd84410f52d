//! Code host adapter trait definition
//!
//! Defines the discovery interface every provider implements, the normalized
//! repository descriptor it returns, and the error taxonomy shared by the
//! adapters and the connection sync engine.

use async_trait::async_trait;
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::config::ConnectionConfig;
use crate::crypto::CryptoError;
use crate::models::repo::RepoMetadata;
use crate::retry::Retryable;

/// Errors raised while discovering repositories on a code host.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("{context} failed with HTTP {status}")]
    Http {
        status: u16,
        context: String,
        /// Epoch seconds from `x-ratelimit-reset`, when present
        rate_limit_reset: Option<i64>,
    },
    #[error("secret '{key}' does not exist")]
    SecretNotFound { key: String },
    #[error("failed to read secret '{key}': {source}")]
    SecretUnreadable {
        key: String,
        #[source]
        source: CryptoError,
    },
    #[error("environment variable '{var}' referenced by the token is not set")]
    EnvTokenMissing { var: String },
    #[error("tokens must reference a secret or an environment variable, not a literal string")]
    LiteralToken,
    #[error("{provider} connections require a token")]
    MissingToken { provider: &'static str },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid connection config: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("failed to decode response from {context}: {message}")]
    Decode { context: String, message: String },
    #[error("pagination error: {0}")]
    Pagination(String),
    #[error("sync timed out after {0}s")]
    Timeout(u64),
    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

impl Retryable for ConnectorError {
    fn status(&self) -> Option<u16> {
        match self {
            ConnectorError::Http { status, .. } => Some(*status),
            ConnectorError::Network(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn rate_limit_reset(&self) -> Option<i64> {
        match self {
            ConnectorError::Http {
                rate_limit_reset, ..
            } => *rate_limit_reset,
            _ => None,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::Network(err) if err.is_timeout() || err.is_connect() => true,
            _ => self
                .status()
                .is_some_and(crate::retry::is_retryable_status),
        }
    }
}

impl ConnectorError {
    pub fn http(status: u16, context: impl Into<String>) -> Self {
        ConnectorError::Http {
            status,
            context: context.into(),
            rate_limit_reset: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ConnectorError::NotFound(_))
            || matches!(self, ConnectorError::Http { status: 404, .. })
    }
}

/// Structured failure payload stored in `connections.sync_status_metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorMetadata {
    /// Stable code the UI keys its message on
    pub code: String,
    pub message: String,
    /// Secret referenced by the connection, for secret and token failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Upstream HTTP status, when the failure came from the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl SyncErrorMetadata {
    pub const SECRET_DNE: &'static str = "CONNECTION_SYNC_SECRET_DNE";
    pub const INVALID_TOKEN: &'static str = "CONNECTION_SYNC_INVALID_TOKEN";
    pub const UNAUTHORIZED: &'static str = "CONNECTION_SYNC_UNAUTHORIZED";
    pub const NOT_FOUND: &'static str = "CONNECTION_SYNC_NOT_FOUND";
    pub const RATE_LIMITED: &'static str = "CONNECTION_SYNC_RATE_LIMITED";
    pub const INVALID_CONFIG: &'static str = "CONNECTION_SYNC_INVALID_CONFIG";
    pub const FAILED: &'static str = "CONNECTION_SYNC_FAILED";

    pub fn from_error(err: &ConnectorError) -> Self {
        let (code, secret_key, status) = match err {
            ConnectorError::SecretNotFound { key } => (Self::SECRET_DNE, Some(key.clone()), None),
            ConnectorError::SecretUnreadable { key, .. } => {
                (Self::INVALID_TOKEN, Some(key.clone()), None)
            }
            ConnectorError::EnvTokenMissing { .. }
            | ConnectorError::LiteralToken
            | ConnectorError::MissingToken { .. } => {
                (Self::INVALID_TOKEN, None, None)
            }
            ConnectorError::Http { status, .. } => {
                let code = match status {
                    401 => Self::UNAUTHORIZED,
                    404 => Self::NOT_FOUND,
                    403 | 429 => Self::RATE_LIMITED,
                    _ => Self::FAILED,
                };
                (code, None, Some(*status))
            }
            ConnectorError::NotFound(_) => (Self::NOT_FOUND, None, None),
            ConnectorError::InvalidConfig(_) => (Self::INVALID_CONFIG, None, None),
            ConnectorError::Network(inner) => {
                (Self::FAILED, None, inner.status().map(|s| s.as_u16()))
            }
            ConnectorError::Decode { .. }
            | ConnectorError::Pagination(_)
            | ConnectorError::Timeout(_)
            | ConnectorError::Db(_) => (Self::FAILED, None, None),
        };

        Self {
            code: code.to_string(),
            message: err.to_string(),
            secret_key,
            status,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// One remote repository, normalized across providers.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoDescriptor {
    pub external_id: String,
    pub external_code_host_type: String,
    pub external_code_host_url: String,
    /// Display name, e.g. `github.com/acme/api`
    pub name: String,
    pub clone_url: String,
    pub web_url: Option<String>,
    pub image_url: Option<String>,
    pub is_fork: bool,
    pub is_archived: bool,
    pub topics: Vec<String>,
    pub metadata: RepoMetadata,
}

impl RepoDescriptor {
    /// Identity of the repo in the catalog.
    pub fn key(&self) -> (&str, &str) {
        (&self.external_id, &self.external_code_host_url)
    }
}

/// Output of one discovery run.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    pub repos: Vec<RepoDescriptor>,
    /// Inclusion targets that were not found upstream
    pub warnings: Vec<String>,
}

/// Downgrade a not-found failure of one inclusion target to a warning.
pub fn warn_if_missing<T: Default>(
    result: Result<T, ConnectorError>,
    warnings: &mut Vec<String>,
    message: impl FnOnce() -> String,
) -> Result<T, ConnectorError> {
    match result {
        Err(err) if err.is_not_found() => {
            let message = message();
            tracing::warn!(error = %err, "{}", message);
            warnings.push(message);
            Ok(T::default())
        }
        other => other,
    }
}

/// Discovers repositories on one kind of code host.
#[async_trait]
pub trait CodeHostAdapter: Send + Sync {
    /// Value of `connections.connection_type` this adapter serves.
    fn code_host_type(&self) -> &'static str;

    /// List the repositories selected by `config`, already filtered and
    /// deduplicated. `token` is the resolved credential, if the config has one.
    async fn discover(
        &self,
        config: &ConnectionConfig,
        token: Option<&str>,
    ) -> Result<DiscoveryResult, ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_errors_carry_key() {
        let meta = SyncErrorMetadata::from_error(&ConnectorError::SecretNotFound {
            key: "gh-token".to_string(),
        });
        assert_eq!(meta.code, SyncErrorMetadata::SECRET_DNE);
        assert_eq!(meta.secret_key.as_deref(), Some("gh-token"));

        let json = meta.to_json();
        assert_eq!(json["secretKey"], "gh-token");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn http_errors_carry_status() {
        let meta = SyncErrorMetadata::from_error(&ConnectorError::http(401, "GET /orgs/acme"));
        assert_eq!(meta.code, SyncErrorMetadata::UNAUTHORIZED);
        assert_eq!(meta.status, Some(401));

        let literal = SyncErrorMetadata::from_error(&ConnectorError::LiteralToken);
        assert_eq!(literal.code, SyncErrorMetadata::INVALID_TOKEN);
    }

    #[test]
    fn retry_classification_follows_status() {
        assert!(ConnectorError::http(429, "x").is_retryable());
        assert!(ConnectorError::http(403, "x").is_retryable());
        assert!(ConnectorError::http(503, "x").is_retryable());
        assert!(!ConnectorError::http(401, "x").is_retryable());
        assert!(!ConnectorError::http(404, "x").is_retryable());
        assert!(!ConnectorError::Pagination("loop".into()).is_retryable());

        let limited = ConnectorError::Http {
            status: 429,
            context: "x".into(),
            rate_limit_reset: Some(1_700_000_000),
        };
        assert_eq!(limited.rate_limit_reset(), Some(1_700_000_000));
    }
}
