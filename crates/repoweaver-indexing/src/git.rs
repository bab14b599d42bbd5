//! Git working-copy operations
//!
//! Network operations (clone and fetch) shell out to the `git` binary so
//! that credential helpers, proxies and protocol support match the host
//! system. Local queries use `git2` on the blocking pool.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use git2::{BranchType, ConfigLevel, ErrorCode, Repository};
use repoweaver_common::redact_credentials;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Refspecs mirrored by every fetch
const FETCH_REFSPECS: [&str; 2] = ["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"];

/// Longest stderr tail kept for error messages
const MAX_STDERR_BYTES: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {operation} failed ({status}): {stderr}")]
    CommandFailed {
        operation: &'static str,
        status: String,
        stderr: String,
    },

    #[error("git operation on {path} failed: {source}")]
    Repository {
        path: String,
        #[source]
        source: git2::Error,
    },

    #[error("Reference {reference} not found in {path}")]
    ReferenceNotFound { path: String, reference: String },

    #[error("Blocking git task failed: {0}")]
    Join(String),

    #[error("Git operation cancelled")]
    Cancelled,
}

/// A progress report parsed from git's stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitProgress {
    /// `clone` or `fetch`
    pub method: &'static str,
    /// e.g. `Receiving objects`
    pub stage: String,
    pub percent: u8,
}

pub type ProgressCallback = Arc<dyn Fn(GitProgress) + Send + Sync>;

/// Result of resolving a reference to a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitLookup {
    Found(String),
    /// The repository has no commits yet
    Empty,
}

/// Operations on a local git working copy
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Bare-clone `clone_url` into `path` and mirror every branch on fetch
    async fn clone_repo(
        &self,
        clone_url: &str,
        path: &Path,
        auth_header: Option<&str>,
        on_progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<(), GitError>;

    /// Fetch every branch and tag from `clone_url`, pruning deleted refs
    ///
    /// The URL is passed on the command line and never written to config.
    async fn fetch(
        &self,
        clone_url: &str,
        path: &Path,
        auth_header: Option<&str>,
        on_progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<(), GitError>;

    /// True only for the root of a repository, bare or not
    async fn is_valid_git_repo_root(&self, path: &Path, token: &CancellationToken) -> bool;

    /// Short names of local branches, e.g. `main`
    async fn get_branches(&self, path: &Path, token: &CancellationToken) -> Result<Vec<String>, GitError>;

    /// Short names of tags, e.g. `v1.0`
    async fn get_tags(&self, path: &Path, token: &CancellationToken) -> Result<Vec<String>, GitError>;

    /// Full name of the branch HEAD points at, e.g. `refs/heads/main`
    async fn get_default_branch(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Option<String>, GitError>;

    async fn get_commit_hash(
        &self,
        path: &Path,
        reference: &str,
        token: &CancellationToken,
    ) -> Result<CommitLookup, GitError>;

    /// Commit time of the newest branch tip
    async fn get_latest_commit_timestamp(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, GitError>;

    /// Set every key in the repository's local config, keeping unrelated keys
    async fn upsert_git_config(
        &self,
        path: &Path,
        entries: &BTreeMap<String, String>,
        token: &CancellationToken,
    ) -> Result<(), GitError>;

    /// Remove `keys` from the local config; missing keys are ignored
    async fn unset_git_config(
        &self,
        path: &Path,
        keys: &[&str],
        token: &CancellationToken,
    ) -> Result<(), GitError>;
}

/// Parse one `\r`/`\n`-separated stderr segment
///
/// `remote: Counting objects:  45% (9/20)` becomes stage
/// `Counting objects` at 45 percent.
pub fn parse_progress(method: &'static str, line: &str) -> Option<GitProgress> {
    let line = line.trim().trim_start_matches("remote:").trim();
    let (stage, rest) = line.split_once(':')?;
    let (percent, _) = rest.trim_start().split_once('%')?;
    let percent: u8 = percent.trim().parse().ok()?;
    Some(GitProgress {
        method,
        stage: stage.trim().to_string(),
        percent: percent.min(100),
    })
}

fn repo_error(path: &Path) -> impl FnOnce(git2::Error) -> GitError + '_ {
    move |source| GitError::Repository {
        path: path.display().to_string(),
        source,
    }
}

/// Run `f` against the repository at `path` on the blocking pool
async fn with_repo<T, F>(path: &Path, token: &CancellationToken, f: F) -> Result<T, GitError>
where
    T: Send + 'static,
    F: FnOnce(&Repository, &Path) -> Result<T, GitError> + Send + 'static,
{
    if token.is_cancelled() {
        return Err(GitError::Cancelled);
    }
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&path).map_err(repo_error(&path))?;
        f(&repo, &path)
    })
    .await
    .map_err(|e| GitError::Join(e.to_string()))?
}

/// `GitClient` backed by the `git` binary and `git2`
#[derive(Debug, Clone)]
pub struct CliGitClient {
    git_binary: PathBuf,
}

impl Default for CliGitClient {
    fn default() -> Self {
        Self::new("git")
    }
}

impl CliGitClient {
    pub fn new(git_binary: impl Into<PathBuf>) -> Self {
        Self {
            git_binary: git_binary.into(),
        }
    }

    /// Run git with `args`, streaming progress until exit or cancellation
    async fn run(
        &self,
        operation: &'static str,
        args: Vec<OsString>,
        on_progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<(), GitError> {
        let mut child = Command::new(&self.git_binary)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(GitError::Spawn)?;

        let mut stderr_pipe = child.stderr.take();
        let work = async {
            let mut captured = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let mut pending = String::new();
                let mut buf = [0_u8; 4096];
                loop {
                    let read = match pipe.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let chunk = String::from_utf8_lossy(buf.get(..read).unwrap_or_default());
                    pending.push_str(&chunk);
                    while let Some(pos) = pending.find(['\r', '\n']) {
                        let segment: String = pending.drain(..=pos).collect();
                        if let Some(progress) = parse_progress(operation, &segment) {
                            tracing::debug!(
                                method = progress.method,
                                stage = %progress.stage,
                                percent = progress.percent,
                                "git progress"
                            );
                            if let Some(callback) = &on_progress {
                                callback(progress);
                            }
                        } else if !segment.trim().is_empty() {
                            captured.push_str(segment.trim_end());
                            captured.push('\n');
                        }
                    }
                }
                captured.push_str(&pending);
            }
            (child.wait().await, captured)
        };

        let (status, stderr) = tokio::select! {
            () = token.cancelled() => return Err(GitError::Cancelled),
            result = work => result,
        };

        let status = status.map_err(GitError::Spawn)?;
        if status.success() {
            return Ok(());
        }

        let stderr = redact_credentials(stderr.trim());
        let start = stderr.len().saturating_sub(MAX_STDERR_BYTES);
        let tail = stderr
            .get(start..)
            .map_or_else(|| stderr.clone(), str::to_string);
        Err(GitError::CommandFailed {
            operation,
            status: status.to_string(),
            stderr: tail,
        })
    }
}

fn header_args(auth_header: Option<&str>) -> Vec<OsString> {
    auth_header
        .map(|header| {
            vec![
                OsString::from("-c"),
                OsString::from(format!("http.extraHeader={header}")),
            ]
        })
        .unwrap_or_default()
}

#[async_trait]
impl GitClient for CliGitClient {
    async fn clone_repo(
        &self,
        clone_url: &str,
        path: &Path,
        auth_header: Option<&str>,
        on_progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<(), GitError> {
        // `-c` before the subcommand applies to this invocation only
        let mut args = header_args(auth_header);
        args.extend([
            OsString::from("clone"),
            OsString::from("--bare"),
            OsString::from("--progress"),
            OsString::from(clone_url),
            path.as_os_str().to_os_string(),
        ]);
        self.run("clone", args, on_progress, token).await?;

        with_repo(path, token, |repo, path| {
            let mut config = repo
                .config()
                .and_then(|c| c.open_level(ConfigLevel::Local))
                .map_err(repo_error(path))?;
            config
                .set_str("remote.origin.fetch", "+refs/heads/*:refs/heads/*")
                .map_err(repo_error(path))?;
            // Clone URLs can carry tokens; fetch passes the URL explicitly
            match config.remove("remote.origin.url") {
                Ok(()) => Ok(()),
                Err(e) if e.code() == ErrorCode::NotFound => Ok(()),
                Err(e) => Err(repo_error(path)(e)),
            }
        })
        .await
    }

    async fn fetch(
        &self,
        clone_url: &str,
        path: &Path,
        auth_header: Option<&str>,
        on_progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<(), GitError> {
        let mut args = vec![OsString::from("-C"), path.as_os_str().to_os_string()];
        args.extend(header_args(auth_header));
        args.push(OsString::from("fetch"));
        args.push(OsString::from(clone_url));
        args.extend(FETCH_REFSPECS.iter().map(OsString::from));
        args.push(OsString::from("--prune"));
        args.push(OsString::from("--progress"));

        self.run("fetch", args, on_progress, token).await
    }

    async fn is_valid_git_repo_root(&self, path: &Path, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || repoweaver_meta_data::is_git_repo_root(&path))
            .await
            .unwrap_or(false)
    }

    async fn get_branches(&self, path: &Path, token: &CancellationToken) -> Result<Vec<String>, GitError> {
        with_repo(path, token, |repo, path| {
            let mut names = Vec::new();
            for branch in repo
                .branches(Some(BranchType::Local))
                .map_err(repo_error(path))?
            {
                let (branch, _) = branch.map_err(repo_error(path))?;
                if let Some(name) = branch.name().map_err(repo_error(path))? {
                    names.push(name.to_string());
                }
            }
            Ok(names)
        })
        .await
    }

    async fn get_tags(&self, path: &Path, token: &CancellationToken) -> Result<Vec<String>, GitError> {
        with_repo(path, token, |repo, path| {
            let tags = repo.tag_names(None).map_err(repo_error(path))?;
            Ok(tags.iter().flatten().map(str::to_string).collect())
        })
        .await
    }

    async fn get_default_branch(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Option<String>, GitError> {
        with_repo(path, token, |repo, path| {
            let head = match repo.find_reference("HEAD") {
                Ok(head) => head,
                Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
                Err(e) => return Err(repo_error(path)(e)),
            };
            Ok(head.symbolic_target().map(str::to_string))
        })
        .await
    }

    async fn get_commit_hash(
        &self,
        path: &Path,
        reference: &str,
        token: &CancellationToken,
    ) -> Result<CommitLookup, GitError> {
        let reference = reference.to_string();
        with_repo(path, token, move |repo, path| {
            match repo
                .revparse_single(&reference)
                .and_then(|object| object.peel_to_commit())
            {
                Ok(commit) => Ok(CommitLookup::Found(commit.id().to_string())),
                Err(e) if matches!(e.code(), ErrorCode::NotFound | ErrorCode::UnbornBranch) => {
                    if repo.is_empty().map_err(repo_error(path))? {
                        Ok(CommitLookup::Empty)
                    } else {
                        Err(GitError::ReferenceNotFound {
                            path: path.display().to_string(),
                            reference,
                        })
                    }
                }
                Err(e) => Err(repo_error(path)(e)),
            }
        })
        .await
    }

    async fn get_latest_commit_timestamp(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, GitError> {
        with_repo(path, token, |repo, path| {
            let mut latest: Option<i64> = None;
            for branch in repo
                .branches(Some(BranchType::Local))
                .map_err(repo_error(path))?
            {
                let (branch, _) = branch.map_err(repo_error(path))?;
                if let Ok(commit) = branch.get().peel_to_commit() {
                    let seconds = commit.time().seconds();
                    latest = Some(latest.map_or(seconds, |l| l.max(seconds)));
                }
            }
            Ok(latest.and_then(|s| Utc.timestamp_opt(s, 0).single()))
        })
        .await
    }

    async fn upsert_git_config(
        &self,
        path: &Path,
        entries: &BTreeMap<String, String>,
        token: &CancellationToken,
    ) -> Result<(), GitError> {
        let entries = entries.clone();
        with_repo(path, token, move |repo, path| {
            let mut config = repo
                .config()
                .and_then(|c| c.open_level(ConfigLevel::Local))
                .map_err(repo_error(path))?;
            for (key, value) in &entries {
                config.set_str(key, value).map_err(repo_error(path))?;
            }
            Ok(())
        })
        .await
    }

    async fn unset_git_config(
        &self,
        path: &Path,
        keys: &[&str],
        token: &CancellationToken,
    ) -> Result<(), GitError> {
        let keys: Vec<String> = keys.iter().map(|k| (*k).to_string()).collect();
        with_repo(path, token, move |repo, path| {
            let mut config = repo
                .config()
                .and_then(|c| c.open_level(ConfigLevel::Local))
                .map_err(repo_error(path))?;
            for key in &keys {
                match config.remove(key) {
                    Ok(()) => {}
                    Err(e) if e.code() == ErrorCode::NotFound => {}
                    Err(e) => return Err(repo_error(path)(e)),
                }
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use repoweaver_test_utils::GitFixture;

    #[test]
    fn test_parse_progress() {
        assert_eq!(
            parse_progress("clone", "remote: Counting objects:  45% (9/20)"),
            Some(GitProgress {
                method: "clone",
                stage: "Counting objects".to_string(),
                percent: 45
            })
        );
        assert_eq!(
            parse_progress("fetch", "Receiving objects: 100% (20/20), 1.2 KiB | 1.2 MiB/s, done."),
            Some(GitProgress {
                method: "fetch",
                stage: "Receiving objects".to_string(),
                percent: 100
            })
        );
        assert_eq!(parse_progress("fetch", "From https://github.com/org/repo"), None);
        assert_eq!(parse_progress("fetch", "fatal: repository not found"), None);
    }

    #[tokio::test]
    async fn test_local_queries_against_fixture() {
        let fixture = GitFixture::new();
        let hash = fixture.commit("README.md", "hello", "initial");
        fixture.branch("release/1.0");
        fixture.tag("v1.0");
        let client = CliGitClient::default();
        let token = CancellationToken::new();

        let mut branches = client.get_branches(fixture.path(), &token).await.unwrap();
        branches.sort();
        assert_eq!(branches, vec!["main".to_string(), "release/1.0".to_string()]);
        assert_eq!(
            client.get_tags(fixture.path(), &token).await.unwrap(),
            vec!["v1.0".to_string()]
        );
        assert_eq!(
            client.get_default_branch(fixture.path(), &token).await.unwrap(),
            Some("refs/heads/main".to_string())
        );
        assert_eq!(
            client
                .get_commit_hash(fixture.path(), "refs/heads/main", &token)
                .await
                .unwrap(),
            CommitLookup::Found(hash)
        );
        assert!(
            client
                .get_latest_commit_timestamp(fixture.path(), &token)
                .await
                .unwrap()
                .is_some()
        );
        assert!(client.is_valid_git_repo_root(fixture.path(), &token).await);
    }

    #[tokio::test]
    async fn test_empty_repository_has_no_commit() {
        let fixture = GitFixture::new();
        let client = CliGitClient::default();
        let token = CancellationToken::new();

        assert_eq!(
            client.get_commit_hash(fixture.path(), "HEAD", &token).await.unwrap(),
            CommitLookup::Empty
        );
        assert_eq!(
            client
                .get_latest_commit_timestamp(fixture.path(), &token)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_config_upsert_and_unset_are_idempotent() {
        let fixture = GitFixture::new();
        fixture.set_origin("https://token@github.com/org/repo.git");
        let client = CliGitClient::default();
        let token = CancellationToken::new();

        let mut entries = BTreeMap::new();
        entries.insert("zoekt.name".to_string(), "github.com/org/repo".to_string());
        client.upsert_git_config(fixture.path(), &entries, &token).await.unwrap();
        client.upsert_git_config(fixture.path(), &entries, &token).await.unwrap();

        client
            .unset_git_config(fixture.path(), &["remote.origin.url"], &token)
            .await
            .unwrap();
        client
            .unset_git_config(fixture.path(), &["remote.origin.url"], &token)
            .await
            .unwrap();

        let repo = Repository::open(fixture.path()).unwrap();
        let config = repo.config().unwrap();
        assert_eq!(config.get_string("zoekt.name").unwrap(), "github.com/org/repo");
        assert!(config.get_string("remote.origin.url").is_err());
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let fixture = GitFixture::new();
        let client = CliGitClient::default();
        let token = CancellationToken::new();
        token.cancel();

        let result = client.get_branches(fixture.path(), &token).await;
        assert!(matches!(result, Err(GitError::Cancelled)));
    }
}
