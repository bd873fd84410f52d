//! Token resolution
//!
//! Connection configs never carry credentials inline. A token is a reference to
//! an org secret or to an environment variable, resolved right before use.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::config::{BitbucketDeployment, ConnectionConfig, TokenConfig};
use super::trait_::ConnectorError;
use crate::crypto::CryptoKey;
use crate::repositories::secret::{SecretError, SecretRepository};

/// Resolves [`TokenConfig`] references into token values.
#[derive(Debug, Clone)]
pub struct TokenResolver {
    secrets: SecretRepository,
    crypto_key: Option<CryptoKey>,
}

impl TokenResolver {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: Option<CryptoKey>) -> Self {
        Self {
            secrets: SecretRepository::new(db),
            crypto_key,
        }
    }

    pub async fn resolve(
        &self,
        org_id: i32,
        token: &TokenConfig,
    ) -> Result<Zeroizing<String>, ConnectorError> {
        match token {
            TokenConfig::Literal(_) => Err(ConnectorError::LiteralToken),
            TokenConfig::Env { env } => std::env::var(env)
                .map(Zeroizing::new)
                .map_err(|_| ConnectorError::EnvTokenMissing { var: env.clone() }),
            TokenConfig::Secret { secret } => {
                let crypto_key = self.crypto_key.as_ref().ok_or_else(|| {
                    ConnectorError::InvalidConfig(format!(
                        "secret '{}' cannot be read without a configured crypto key",
                        secret
                    ))
                })?;

                match self.secrets.reveal(crypto_key, org_id, secret).await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(ConnectorError::SecretNotFound {
                        key: secret.clone(),
                    }),
                    Err(SecretError::Db(err)) => Err(ConnectorError::Db(err)),
                    Err(SecretError::Crypto(source)) => Err(ConnectorError::SecretUnreadable {
                        key: secret.clone(),
                        source,
                    }),
                }
            }
        }
    }

    /// Resolve the connection's token, if its config declares one.
    pub async fn resolve_for(
        &self,
        org_id: i32,
        config: &ConnectionConfig,
    ) -> Result<Option<Zeroizing<String>>, ConnectorError> {
        match config.token() {
            Some(token) => self.resolve(org_id, token).await.map(Some),
            None => Ok(None),
        }
    }
}

/// `Authorization` header value git uses for clone and fetch against the
/// connection's host.
pub fn git_auth_header(config: &ConnectionConfig, token: &str) -> Option<Zeroizing<String>> {
    let basic = |user: &str, password: &str| {
        Zeroizing::new(format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", user, password))
        ))
    };

    match config {
        ConnectionConfig::Github(_) => Some(basic("x-access-token", token)),
        ConnectionConfig::Gitlab(_) => Some(basic("oauth2", token)),
        ConnectionConfig::Gitea(_) => Some(basic(token, "")),
        ConnectionConfig::Bitbucket(bitbucket) => match bitbucket.deployment_type {
            BitbucketDeployment::Cloud => Some(basic(
                bitbucket.user.as_deref().unwrap_or("x-token-auth"),
                token,
            )),
            BitbucketDeployment::Server => Some(Zeroizing::new(format!("Bearer {}", token))),
        },
        ConnectionConfig::AzureDevOps(_) => Some(basic("", token)),
        ConnectionConfig::Gerrit(_) | ConnectionConfig::Git(_) => None,
    }
}
