//! # Git
//!
//! The [`Git`] trait is everything the job worker needs from git: bare clones,
//! fetches, config edits and ref listing. [`CliGit`] shells out to the `git`
//! binary. Credentials are passed as an `http.extraHeader` through
//! `GIT_CONFIG_*` environment variables so they never appear in argv or in the
//! stored config of the clone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::JobError;

/// Receives git progress lines (`Receiving objects:  42% ...`).
pub type ProgressFn = dyn Fn(&str) + Send + Sync;

/// Lines of stderr kept for error messages.
const STDERR_TAIL: usize = 20;

/// Stored remote URL written by clones made before fetches passed the URL directly.
pub const LEGACY_ORIGIN_URL_KEY: &str = "remote.origin.url";

const MIRROR_REFSPEC: &str = "+refs/heads/*:refs/heads/*";

/// Exit code of `git config --unset-all` when the key is absent.
const CONFIG_KEY_MISSING: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Branch,
    Tag,
}

/// A branch or tag, by short name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRef {
    pub name: String,
    pub kind: RefKind,
}

#[async_trait]
pub trait Git: Send + Sync {
    /// Bare-clone `url` into `dest`, mirroring every branch.
    async fn clone_repo(
        &self,
        url: &str,
        auth_header: Option<&str>,
        dest: &Path,
        on_progress: &ProgressFn,
    ) -> Result<(), JobError>;

    /// Fetch and prune every branch of `url` into the clone at `path`.
    /// The URL is passed on the command line, not read from the clone's config.
    async fn fetch(
        &self,
        url: &str,
        auth_header: Option<&str>,
        path: &Path,
        on_progress: &ProgressFn,
    ) -> Result<(), JobError>;

    /// Whether `path` is itself the root of a git repository.
    async fn is_valid_git_repo_root(&self, path: &Path) -> bool;

    async fn unset_git_config(&self, path: &Path, keys: &[&str]) -> Result<(), JobError>;

    async fn upsert_git_config(
        &self,
        path: &Path,
        config: &BTreeMap<String, String>,
    ) -> Result<(), JobError>;

    async fn list_refs(&self, path: &Path) -> Result<Vec<GitRef>, JobError>;

    /// Commit `HEAD` points at, `None` for an empty repository.
    async fn head_commit(&self, path: &Path) -> Result<Option<String>, JobError>;
}

/// [`Git`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct CliGit {
    binary: PathBuf,
}

impl Default for CliGit {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

struct Invocation<'a> {
    args: Vec<&'a str>,
    cwd: Option<&'a Path>,
    auth_header: Option<&'a str>,
    on_progress: Option<&'a ProgressFn>,
}

impl<'a> Invocation<'a> {
    fn new(args: Vec<&'a str>) -> Self {
        Self {
            args,
            cwd: None,
            auth_header: None,
            on_progress: None,
        }
    }

    fn in_dir(mut self, cwd: &'a Path) -> Self {
        self.cwd = Some(cwd);
        self
    }

    fn with_auth(mut self, auth_header: Option<&'a str>) -> Self {
        self.auth_header = auth_header;
        self
    }

    fn with_progress(mut self, on_progress: &'a ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }
}

struct Output {
    code: Option<i32>,
    stdout: String,
    stderr_tail: Vec<String>,
}

impl CliGit {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, invocation: Invocation<'_>) -> Result<Output, JobError> {
        let mut command = Command::new(&self.binary);
        if let Some(cwd) = invocation.cwd {
            command.arg("-C").arg(cwd);
        }
        command
            .args(&invocation.args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(header) = invocation.auth_header {
            command
                .env("GIT_CONFIG_COUNT", "1")
                .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                .env("GIT_CONFIG_VALUE_0", format!("Authorization: {}", header));
        }

        let mut child = command
            .spawn()
            .map_err(|err| JobError::Git(format!("failed to spawn git: {}", err)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(mut stdout) = stdout {
                stdout.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
        };
        let read_stderr = async {
            match stderr {
                Some(stderr) => stream_lines(stderr, invocation.on_progress).await,
                None => Ok(Vec::new()),
            }
        };

        let (stdout, stderr_tail) = tokio::try_join!(read_stdout, read_stderr)?;
        let status = child.wait().await?;

        Ok(Output {
            code: status.code(),
            stdout,
            stderr_tail,
        })
    }

    async fn run(&self, invocation: Invocation<'_>) -> Result<String, JobError> {
        let command = invocation.args.first().copied().unwrap_or("git").to_string();
        let output = self.exec(invocation).await?;
        if output.code != Some(0) {
            return Err(failure(&command, &output));
        }
        Ok(output.stdout)
    }
}

fn failure(command: &str, output: &Output) -> JobError {
    let code = output
        .code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string());
    JobError::Git(format!(
        "git {} exited with {}: {}",
        command,
        code,
        output.stderr_tail.join("\n")
    ))
}

/// Read `reader` to the end, passing every `\r` or `\n` terminated line to
/// `on_progress` and returning the last [`STDERR_TAIL`] lines.
async fn stream_lines<R: AsyncRead + Unpin>(
    mut reader: R,
    on_progress: Option<&ProgressFn>,
) -> std::io::Result<Vec<String>> {
    let mut tail = Vec::new();
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        for &byte in &chunk[..read] {
            if byte == b'\r' || byte == b'\n' {
                emit_line(&mut pending, &mut tail, on_progress);
            } else {
                pending.push(byte);
            }
        }
    }
    emit_line(&mut pending, &mut tail, on_progress);

    Ok(tail)
}

fn emit_line(pending: &mut Vec<u8>, tail: &mut Vec<String>, on_progress: Option<&ProgressFn>) {
    if pending.is_empty() {
        return;
    }
    let line = String::from_utf8_lossy(pending).trim().to_string();
    pending.clear();
    if line.is_empty() {
        return;
    }
    if let Some(on_progress) = on_progress {
        on_progress(&line);
    }
    if tail.len() == STDERR_TAIL {
        tail.remove(0);
    }
    tail.push(line);
}

#[async_trait]
impl Git for CliGit {
    #[instrument(skip(self, auth_header, on_progress), fields(dest = %dest.display()))]
    async fn clone_repo(
        &self,
        url: &str,
        auth_header: Option<&str>,
        dest: &Path,
        on_progress: &ProgressFn,
    ) -> Result<(), JobError> {
        let dest_str = dest.to_string_lossy();
        self.run(
            Invocation::new(vec!["clone", "--bare", "--progress", url, dest_str.as_ref()])
                .with_auth(auth_header)
                .with_progress(on_progress),
        )
        .await?;

        // Fetches pass the URL explicitly.
        self.unset_git_config(dest, &[LEGACY_ORIGIN_URL_KEY]).await?;

        debug!("Clone finished");
        Ok(())
    }

    #[instrument(skip(self, auth_header, on_progress), fields(path = %path.display()))]
    async fn fetch(
        &self,
        url: &str,
        auth_header: Option<&str>,
        path: &Path,
        on_progress: &ProgressFn,
    ) -> Result<(), JobError> {
        self.run(
            Invocation::new(vec!["fetch", "--prune", "--progress", url, MIRROR_REFSPEC])
                .in_dir(path)
                .with_auth(auth_header)
                .with_progress(on_progress),
        )
        .await?;

        debug!("Fetch finished");
        Ok(())
    }

    async fn is_valid_git_repo_root(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        let Ok(output) = self
            .exec(Invocation::new(vec!["rev-parse", "--absolute-git-dir"]).in_dir(path))
            .await
        else {
            return false;
        };
        if output.code != Some(0) {
            return false;
        }

        let (Ok(git_dir), Ok(root)) = (
            std::fs::canonicalize(output.stdout.trim()),
            std::fs::canonicalize(path),
        ) else {
            return false;
        };
        git_dir == root || git_dir == root.join(".git")
    }

    async fn unset_git_config(&self, path: &Path, keys: &[&str]) -> Result<(), JobError> {
        for key in keys {
            let output = self
                .exec(Invocation::new(vec!["config", "--unset-all", *key]).in_dir(path))
                .await?;
            match output.code {
                Some(0) | Some(CONFIG_KEY_MISSING) => {}
                _ => return Err(failure("config --unset-all", &output)),
            }
        }
        Ok(())
    }

    async fn upsert_git_config(
        &self,
        path: &Path,
        config: &BTreeMap<String, String>,
    ) -> Result<(), JobError> {
        for (key, value) in config {
            self.run(Invocation::new(vec!["config", key.as_str(), value.as_str()]).in_dir(path))
                .await?;
        }
        Ok(())
    }

    async fn list_refs(&self, path: &Path) -> Result<Vec<GitRef>, JobError> {
        let stdout = self
            .run(
                Invocation::new(vec![
                    "for-each-ref",
                    "--format=%(refname)",
                    "refs/heads",
                    "refs/tags",
                ])
                .in_dir(path),
            )
            .await?;

        Ok(parse_refs(&stdout))
    }

    async fn head_commit(&self, path: &Path) -> Result<Option<String>, JobError> {
        let output = self
            .exec(Invocation::new(vec!["rev-parse", "--verify", "--quiet", "HEAD"]).in_dir(path))
            .await?;
        match output.code {
            Some(0) => Ok(Some(output.stdout.trim().to_string())),
            // `--verify --quiet` exits 1 without output when HEAD is unborn
            Some(1) => Ok(None),
            _ => Err(failure("rev-parse", &output)),
        }
    }
}

fn parse_refs(stdout: &str) -> Vec<GitRef> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if let Some(name) = line.strip_prefix("refs/heads/") {
                Some(GitRef {
                    name: name.to_string(),
                    kind: RefKind::Branch,
                })
            } else {
                line.strip_prefix("refs/tags/").map(|name| GitRef {
                    name: name.to_string(),
                    kind: RefKind::Tag,
                })
            }
        })
        .collect()
}
