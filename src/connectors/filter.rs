//! Inclusion and exclusion rules shared by the adapters.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use super::config::SizeRange;
use super::trait_::{ConnectorError, RepoDescriptor};
use crate::glob::GlobSet;

/// Facts about one repository that the rules are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// Provider-qualified name the name globs match, e.g. `workspace/PROJ/repo`
    pub qualified_name: &'a str,
    pub is_fork: bool,
    pub is_archived: bool,
    pub topics: &'a [String],
    /// Size in bytes, when the provider reports one
    pub size_bytes: Option<u64>,
}

/// Why a candidate was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    Fork,
    Archived,
    Name(String),
    TopicExcluded(Vec<String>),
    TopicNotIncluded,
    TooSmall { size: u64, min: u64 },
    TooLarge { size: u64, max: u64 },
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::Fork => write!(f, "`exclude.forks` is true"),
            Exclusion::Archived => write!(f, "`exclude.archived` is true"),
            Exclusion::Name(name) => write!(f, "name glob matches {}", name),
            Exclusion::TopicExcluded(topics) => {
                write!(f, "`exclude.topics` matches {}", topics.join(", "))
            }
            Exclusion::TopicNotIncluded => write!(f, "no topic matches `topics`"),
            Exclusion::TooSmall { size, min } => {
                write!(f, "size {} is below the minimum of {}", size, min)
            }
            Exclusion::TooLarge { size, max } => {
                write!(f, "size {} is above the maximum of {}", size, max)
            }
        }
    }
}

/// Compiled filter for one connection.
#[derive(Debug, Clone, Default)]
pub struct RepoFilter {
    forks: bool,
    archived: bool,
    names: GlobSet,
    exclude_topics: GlobSet,
    include_topics: Option<GlobSet>,
    size: Option<SizeRange>,
}

impl RepoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_forks(mut self, enabled: bool) -> Self {
        self.forks = enabled;
        self
    }

    pub fn exclude_archived(mut self, enabled: bool) -> Self {
        self.archived = enabled;
        self
    }

    pub fn exclude_names(mut self, globs: &[String]) -> Result<Self, ConnectorError> {
        self.names = compile(globs, false)?;
        Ok(self)
    }

    pub fn exclude_topics(mut self, globs: &[String]) -> Result<Self, ConnectorError> {
        self.exclude_topics = compile(globs, true)?;
        Ok(self)
    }

    /// An empty list means every repo passes the topic inclusion check.
    pub fn include_topics(mut self, globs: &[String]) -> Result<Self, ConnectorError> {
        self.include_topics = if globs.is_empty() {
            None
        } else {
            Some(compile(globs, true)?)
        };
        Ok(self)
    }

    pub fn size(mut self, range: Option<SizeRange>) -> Self {
        self.size = range;
        self
    }

    /// First rule that drops the candidate, in a fixed evaluation order.
    pub fn exclusion(&self, candidate: &Candidate<'_>) -> Option<Exclusion> {
        if self.forks && candidate.is_fork {
            return Some(Exclusion::Fork);
        }

        if self.archived && candidate.is_archived {
            return Some(Exclusion::Archived);
        }

        if self.names.is_match(candidate.qualified_name) {
            return Some(Exclusion::Name(candidate.qualified_name.to_string()));
        }

        if !self.exclude_topics.is_empty() {
            let matched: Vec<String> = candidate
                .topics
                .iter()
                .filter(|topic| self.exclude_topics.is_match(&topic.to_lowercase()))
                .cloned()
                .collect();
            if !matched.is_empty() {
                return Some(Exclusion::TopicExcluded(matched));
            }
        }

        if let Some(include) = &self.include_topics {
            let any = candidate
                .topics
                .iter()
                .any(|topic| include.is_match(&topic.to_lowercase()));
            if !any {
                return Some(Exclusion::TopicNotIncluded);
            }
        }

        if let (Some(range), Some(size)) = (self.size, candidate.size_bytes) {
            if let Some(min) = range.min
                && size < min
            {
                return Some(Exclusion::TooSmall { size, min });
            }
            if let Some(max) = range.max
                && size > max
            {
                return Some(Exclusion::TooLarge { size, max });
            }
        }

        None
    }

    /// Whether the candidate survives, logging the reason when it does not.
    pub fn keep(&self, candidate: &Candidate<'_>) -> bool {
        match self.exclusion(candidate) {
            Some(reason) => {
                debug!(repo = candidate.qualified_name, %reason, "Excluding repository");
                false
            }
            None => true,
        }
    }
}

fn compile(globs: &[String], lowercase: bool) -> Result<GlobSet, ConnectorError> {
    let result = if lowercase {
        GlobSet::new_lowercase(globs)
    } else {
        GlobSet::new(globs)
    };
    result.map_err(|err| ConnectorError::InvalidConfig(err.to_string()))
}

/// Collapse descriptors sharing `(external_id, external_code_host_url)`.
///
/// The last occurrence wins and takes the slot of the first, so output order
/// follows first discovery.
pub fn dedup_descriptors(descriptors: Vec<RepoDescriptor>) -> Vec<RepoDescriptor> {
    let mut positions: HashMap<(String, String), usize> = HashMap::new();
    let mut output: Vec<RepoDescriptor> = Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        let key = (
            descriptor.external_id.clone(),
            descriptor.external_code_host_url.clone(),
        );
        match positions.get(&key) {
            Some(&index) => output[index] = descriptor,
            None => {
                positions.insert(key, output.len());
                output.push(descriptor);
            }
        }
    }

    output
}
