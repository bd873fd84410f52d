//! HTTP plumbing for the adapters: authentication headers, status mapping,
//! rate-limit extraction, `Link` pagination and loop guards.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, USER_AGENT};
use serde::de::DeserializeOwned;
use url::Url;

use super::trait_::ConnectorError;
use crate::retry::RetryingFetcher;

/// Upper bound on pages fetched for a single listing.
pub const MAX_PAGES: usize = 1_000;

const USER_AGENT_VALUE: &str = concat!("repo-sync/", env!("CARGO_PKG_VERSION"));

/// How requests authenticate against a code host API.
#[derive(Clone, Default)]
pub enum Auth {
    #[default]
    None,
    Bearer(String),
    /// `Authorization: token <value>`, as used by Gitea
    Token(String),
    Basic {
        username: String,
        password: String,
    },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Auth::None => "None",
            Auth::Bearer(_) => "Bearer",
            Auth::Token(_) => "Token",
            Auth::Basic { .. } => "Basic",
        };
        write!(f, "Auth::{}([REDACTED])", kind)
    }
}

impl Auth {
    pub fn bearer(token: Option<&str>) -> Self {
        token.map_or(Auth::None, |t| Auth::Bearer(t.to_string()))
    }

    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Auth::None => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Token(token) => request.header(AUTHORIZATION, format!("token {}", token)),
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }
}

/// A decoded response body together with its headers.
#[derive(Debug)]
pub struct Response<T> {
    pub body: T,
    pub headers: HeaderMap,
}

/// Shared API client; every request goes through the retry policy.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    fetcher: RetryingFetcher,
}

impl HttpClient {
    pub fn new(fetcher: RetryingFetcher) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT_VALUE)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client, fetcher })
    }

    pub fn fetcher(&self) -> &RetryingFetcher {
        &self.fetcher
    }

    /// GET `url` and decode a JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        auth: &Auth,
        identifier: &str,
    ) -> Result<Response<T>, ConnectorError> {
        let response = self.get_text(url, auth, identifier).await?;
        let body = serde_json::from_str(&response.body).map_err(|err| ConnectorError::Decode {
            context: redact(url),
            message: err.to_string(),
        })?;
        Ok(Response {
            body,
            headers: response.headers,
        })
    }

    /// GET `url` and return the raw body.
    pub async fn get_text(
        &self,
        url: &Url,
        auth: &Auth,
        identifier: &str,
    ) -> Result<Response<String>, ConnectorError> {
        self.fetcher
            .retry(identifier, || self.send_once(url, auth))
            .await
    }

    async fn send_once(&self, url: &Url, auth: &Auth) -> Result<Response<String>, ConnectorError> {
        let request = self
            .client
            .get(url.clone())
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, USER_AGENT_VALUE);
        let response = auth.apply(request).send().await?;

        let status = response.status();
        let headers = response.headers().clone();

        if !status.is_success() {
            return Err(ConnectorError::Http {
                status: status.as_u16(),
                context: format!("GET {}", redact(url)),
                rate_limit_reset: rate_limit_reset(&headers),
            });
        }

        let body = response.text().await?;
        Ok(Response { body, headers })
    }
}

/// Epoch seconds from `x-ratelimit-reset`.
pub fn rate_limit_reset(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Target of the `rel="next"` entry in a `Link` header.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get("link")?.to_str().ok()?;

    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

/// Integer header value, e.g. Gitea's `x-total-count`.
pub fn header_usize(headers: &HeaderMap, name: &str) -> Option<usize> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Guards a pagination loop against runaway or non-advancing cursors.
#[derive(Debug)]
pub struct PageGuard {
    listing: String,
    seen: HashSet<String>,
    pages: usize,
    max_pages: usize,
}

impl PageGuard {
    pub fn new(listing: impl Into<String>) -> Self {
        Self::with_limit(listing, MAX_PAGES)
    }

    pub fn with_limit(listing: impl Into<String>, max_pages: usize) -> Self {
        Self {
            listing: listing.into(),
            seen: HashSet::new(),
            pages: 0,
            max_pages,
        }
    }

    /// Record that `cursor` is about to be fetched.
    pub fn advance(&mut self, cursor: &str) -> Result<(), ConnectorError> {
        self.pages += 1;
        if self.pages > self.max_pages {
            return Err(ConnectorError::Pagination(format!(
                "{} exceeded {} pages",
                self.listing, self.max_pages
            )));
        }
        if !self.seen.insert(cursor.to_string()) {
            return Err(ConnectorError::Pagination(format!(
                "{} returned cursor '{}' twice",
                self.listing, cursor
            )));
        }
        Ok(())
    }
}

/// Percent-encode one path segment, including `/`.
pub fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// URL with any embedded credentials removed, for logs and errors.
pub fn redact(url: &Url) -> String {
    let mut clean = url.clone();
    let _ = clean.set_username("");
    let _ = clean.set_password(None);
    clean.to_string()
}
