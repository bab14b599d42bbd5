//! Search index builder invocation

use async_trait::async_trait;
use repoweaver_meta_data::Repo;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::shards::shard_prefix;

#[derive(Error, Debug)]
pub enum IndexBuildError {
    #[error("Failed to spawn index builder {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Index builder exited with {status} for repo {repo_id}")]
    Failed { repo_id: i64, status: String },

    #[error("Index build cancelled")]
    Cancelled,
}

/// Builds search index shards for a working copy
#[async_trait]
pub trait IndexBuilder: Send + Sync {
    /// Index `revisions` of the repository checked out at `repo_path`
    async fn build_index(
        &self,
        repo: &Repo,
        repo_path: &Path,
        revisions: &[String],
        token: &CancellationToken,
    ) -> Result<(), IndexBuildError>;
}

/// Runs `zoekt-git-index` against a bare working copy
#[derive(Debug, Clone)]
pub struct ZoektIndexBuilder {
    binary: PathBuf,
    index_dir: PathBuf,
    max_trigram_count: u64,
    max_file_size: u64,
}

impl ZoektIndexBuilder {
    pub fn new(
        binary: impl Into<PathBuf>,
        index_dir: impl Into<PathBuf>,
        max_trigram_count: u64,
        max_file_size: u64,
    ) -> Self {
        Self {
            binary: binary.into(),
            index_dir: index_dir.into(),
            max_trigram_count,
            max_file_size,
        }
    }

    /// Command-line arguments for one build
    pub fn args(&self, repo: &Repo, repo_path: &Path, revisions: &[String]) -> Vec<OsString> {
        vec![
            OsString::from("-allow_missing_branches"),
            OsString::from("-index"),
            self.index_dir.as_os_str().to_os_string(),
            OsString::from("-max_trigram_count"),
            OsString::from(self.max_trigram_count.to_string()),
            OsString::from("-file_limit"),
            OsString::from(self.max_file_size.to_string()),
            OsString::from("-branches"),
            OsString::from(revisions.join(",")),
            OsString::from("-tenant_id"),
            OsString::from(repo.org_id.to_string()),
            OsString::from("-repo_id"),
            OsString::from(repo.id.to_string()),
            OsString::from("-shard_prefix"),
            OsString::from(shard_prefix(repo.org_id, repo.id)),
            repo_path.as_os_str().to_os_string(),
        ]
    }
}

/// Log every line of `stream`; the builder reports progress on both pipes
async fn log_lines<R>(stream: Option<R>, repo_id: i64)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::info!(repo_id, "{line}");
        }
    }
}

#[async_trait]
impl IndexBuilder for ZoektIndexBuilder {
    async fn build_index(
        &self,
        repo: &Repo,
        repo_path: &Path,
        revisions: &[String],
        token: &CancellationToken,
    ) -> Result<(), IndexBuildError> {
        if token.is_cancelled() {
            return Err(IndexBuildError::Cancelled);
        }

        let mut child = Command::new(&self.binary)
            .args(self.args(repo, repo_path, revisions))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| IndexBuildError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let work = async {
            tokio::join!(log_lines(stdout, repo.id), log_lines(stderr, repo.id));
            child.wait().await
        };

        let status = tokio::select! {
            () = token.cancelled() => return Err(IndexBuildError::Cancelled),
            status = work => status,
        };

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(IndexBuildError::Failed {
                repo_id: repo.id,
                status: status.to_string(),
            }),
            Err(source) => Err(IndexBuildError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            }),
        }
    }
}
