//! Adapter registry
//!
//! Maps a connection type (`github`, `gitlab`, ...) to the adapter that
//! discovers its repositories.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connectors::http::HttpClient;
use crate::connectors::{
    AzureDevOpsAdapter, BitbucketAdapter, CodeHostAdapter, GenericGitAdapter, GerritAdapter,
    GitHubAdapter, GitLabAdapter, GiteaAdapter,
};

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Code host type '{name}' is not supported")]
    ProviderNotFound { name: String },
}

/// Adapters keyed by the connection type they serve
#[derive(Clone, Default)]
pub struct Registry {
    adapters: HashMap<&'static str, Arc<dyn CodeHostAdapter>>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with one adapter per supported code host, sharing `http`.
    pub fn with_default_adapters(http: HttpClient) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GitHubAdapter::new(http.clone())));
        registry.register(Arc::new(GitLabAdapter::new(http.clone())));
        registry.register(Arc::new(GiteaAdapter::new(http.clone())));
        registry.register(Arc::new(GerritAdapter::new(http.clone())));
        registry.register(Arc::new(BitbucketAdapter::new(http.clone())));
        registry.register(Arc::new(AzureDevOpsAdapter::new(http)));
        registry.register(Arc::new(GenericGitAdapter::new()));
        registry
    }

    /// Register an adapter, replacing any previous one for the same type.
    pub fn register(&mut self, adapter: Arc<dyn CodeHostAdapter>) {
        self.adapters.insert(adapter.code_host_type(), adapter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CodeHostAdapter>, RegistryError> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound {
                name: name.to_string(),
            })
    }

    /// Registered connection types, sorted for stable ordering
    pub fn list_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.adapters.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("adapters", &self.list_types())
            .finish()
    }
}
