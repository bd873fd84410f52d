//! # Indexer
//!
//! Builds search index shards for one repository working copy. The job worker
//! only needs [`Indexer::index_repository`]; [`CommandIndexer`] runs
//! `zoekt-git-index` (or a compatible command) with the shard prefix derived
//! from the repo's org and id, which is also how cleanup finds the shards again.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::JobError;

/// Largest file, in bytes, the indexer includes.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// Files with more distinct trigrams than this are skipped.
pub const DEFAULT_MAX_TRIGRAM_COUNT: u64 = 20_000;

/// Prefix of every shard file written for a repo.
pub fn shard_prefix(org_id: i32, repo_id: Uuid) -> String {
    format!("{}_{}", org_id, repo_id)
}

/// Everything the indexer needs to know about one INDEX run.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRequest {
    pub repo_id: Uuid,
    pub org_id: i32,
    pub repo_path: PathBuf,
    /// `HEAD` followed by fully qualified branch and tag refs
    pub revisions: Vec<String>,
}

impl IndexRequest {
    pub fn shard_prefix(&self) -> String {
        shard_prefix(self.org_id, self.repo_id)
    }
}

#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index_repository(&self, request: &IndexRequest) -> Result<(), JobError>;
}

/// [`Indexer`] that runs an external command against the working copy.
#[derive(Debug, Clone)]
pub struct CommandIndexer {
    program: String,
    extra_args: Vec<String>,
    index_dir: PathBuf,
    max_file_size: u64,
    max_trigram_count: u64,
}

impl CommandIndexer {
    /// `command` is split on whitespace; the first word is the program.
    pub fn new(command: &str, index_dir: impl Into<PathBuf>) -> Result<Self, JobError> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| JobError::Indexer("indexer command is empty".to_string()))?;

        Ok(Self {
            program,
            extra_args: words.collect(),
            index_dir: index_dir.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_trigram_count: DEFAULT_MAX_TRIGRAM_COUNT,
        })
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    fn args(&self, request: &IndexRequest) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend([
            "-allow_missing_branches".to_string(),
            "-index".to_string(),
            self.index_dir.to_string_lossy().into_owned(),
            "-max_trigram_count".to_string(),
            self.max_trigram_count.to_string(),
            "-file_limit".to_string(),
            self.max_file_size.to_string(),
            "-branches".to_string(),
            request.revisions.join(","),
            "-tenant_id".to_string(),
            request.org_id.to_string(),
            "-repo_id".to_string(),
            request.repo_id.to_string(),
            "-shard_prefix".to_string(),
            request.shard_prefix(),
            request.repo_path.to_string_lossy().into_owned(),
        ]);
        args
    }
}

#[async_trait]
impl Indexer for CommandIndexer {
    #[instrument(skip(self, request), fields(repo_id = %request.repo_id))]
    async fn index_repository(&self, request: &IndexRequest) -> Result<(), JobError> {
        tokio::fs::create_dir_all(&self.index_dir).await?;

        let output = Command::new(&self.program)
            .args(self.args(request))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| JobError::Indexer(format!("failed to spawn {}: {}", self.program, err)))?;

        // zoekt reports progress on stderr, so neither stream is treated as an error.
        for line in String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .filter(|line| !line.trim().is_empty())
        {
            debug!(target: "repo_sync::indexer::output", "{}", line);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(10).collect();
            return Err(JobError::Indexer(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join("\n")
            )));
        }

        info!(revisions = request.revisions.len(), "Index shards written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> IndexRequest {
        IndexRequest {
            repo_id: Uuid::nil(),
            org_id: 7,
            repo_path: PathBuf::from("/data/repos/abc"),
            revisions: vec!["HEAD".into(), "refs/heads/main".into()],
        }
    }

    #[test]
    fn args_carry_shard_prefix_and_revisions() {
        let indexer = CommandIndexer::new("zoekt-git-index", "/data/index").unwrap();
        let args = indexer.args(&request());

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("-index") + 1], "/data/index");
        assert_eq!(args[pos("-branches") + 1], "HEAD,refs/heads/main");
        assert_eq!(
            args[pos("-shard_prefix") + 1],
            format!("7_{}", Uuid::nil())
        );
        assert_eq!(args.last().map(String::as_str), Some("/data/repos/abc"));
    }

    #[test]
    fn leading_words_become_extra_args() {
        let indexer = CommandIndexer::new("nice -n 10", "/idx").unwrap();
        assert_eq!(indexer.program, "nice");
        assert_eq!(indexer.args(&request())[..2], ["-n", "10"]);

        assert!(matches!(
            CommandIndexer::new("   ", "/idx"),
            Err(JobError::Indexer(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_an_indexer_error() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = CommandIndexer::new("false", dir.path()).unwrap();

        let err = indexer.index_repository(&request()).await.unwrap_err();
        assert!(matches!(err, JobError::Indexer(_)));
    }
}
