//! Test doubles for the manager's collaborators
//!
//! Used by this crate's unit tests and by the `tests/` integration suite.

// Allow test-specific patterns in mock implementations
#![allow(clippy::unwrap_used)] // Mocks can panic on lock poisoning
#![allow(clippy::arithmetic_side_effects)] // Test counters can overflow
#![allow(clippy::significant_drop_tightening)] // Mock locks don't need optimization

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::Repository;
use repoweaver_meta_data::{JobType, Repo, RepoIndexingStatus, RepoMetadata};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::git::{CliGitClient, CommitLookup, GitClient, GitError, ProgressCallback};
use crate::index_builder::{IndexBuildError, IndexBuilder};
use crate::shards::shard_prefix;
use crate::telemetry::{
    ACTIVE_JOBS, Event, EventSink, JOB_FAIL_TOTAL, JOB_REATTEMPTS_TOTAL, JOB_SUCCESS_TOTAL,
    JobMetrics, PENDING_JOBS,
};

/// A repository row with org 1 and an https clone URL derived from `name`
pub fn sample_repo(id: i64, name: &str) -> Repo {
    let now = Utc::now();
    Repo {
        id,
        org_id: 1,
        name: name.to_string(),
        display_name: None,
        clone_url: format!("https://{name}.git"),
        web_url: Some(format!("https://{name}")),
        image_url: None,
        default_branch: Some("main".to_string()),
        is_fork: false,
        is_archived: false,
        is_public: true,
        is_auto_cleanup_disabled: false,
        size_bytes: None,
        metadata: RepoMetadata::default(),
        external_id: name.to_string(),
        external_code_host_type: "github".to_string(),
        external_code_host_url: "https://github.com".to_string(),
        indexing_status: RepoIndexingStatus::New,
        latest_indexing_job_status: None,
        indexed_at: None,
        indexed_commit_hash: None,
        pushed_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// A network operation observed by [`MockGitClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCall {
    pub method: &'static str,
    pub clone_url: String,
    pub path: PathBuf,
    pub auth_header: Option<String>,
}

/// Git client whose remotes are local repositories
///
/// Clone and fetch mirror branches and tags from the registered source with
/// libgit2; every local query goes to [`CliGitClient`].
#[derive(Clone, Default)]
pub struct MockGitClient {
    local: CliGitClient,
    remotes: Arc<Mutex<HashMap<String, PathBuf>>>,
    calls: Arc<Mutex<Vec<GitCall>>>,
}

impl MockGitClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `clone_url` from the repository at `source`
    pub fn with_remote(self, clone_url: &str, source: &Path) -> Self {
        self.remotes
            .lock()
            .unwrap()
            .insert(clone_url.to_string(), source.to_path_buf());
        self
    }

    pub fn calls(&self) -> Vec<GitCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, method: &'static str, clone_url: &str, path: &Path, auth_header: Option<&str>) {
        self.calls.lock().unwrap().push(GitCall {
            method,
            clone_url: clone_url.to_string(),
            path: path.to_path_buf(),
            auth_header: auth_header.map(String::from),
        });
    }

    async fn mirror(
        &self,
        method: &'static str,
        clone_url: &str,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<(), GitError> {
        if token.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        let source = self.remotes.lock().unwrap().get(clone_url).cloned();
        let Some(source) = source else {
            return Err(GitError::CommandFailed {
                operation: method,
                status: "exit status: 128".to_string(),
                stderr: format!("fatal: repository '{clone_url}' not found"),
            });
        };

        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || mirror_blocking(&source, &path))
            .await
            .map_err(|e| GitError::Join(e.to_string()))?
    }
}

fn mirror_blocking(source: &Path, path: &Path) -> Result<(), GitError> {
    let to_git_error = |source_err: git2::Error| GitError::Repository {
        path: path.display().to_string(),
        source: source_err,
    };

    let repo = match Repository::open_bare(path) {
        Ok(repo) => repo,
        Err(_) => Repository::init_bare(path).map_err(to_git_error)?,
    };
    let source_url = source.display().to_string();
    let mut remote = repo.remote_anonymous(&source_url).map_err(to_git_error)?;
    remote
        .fetch(
            &["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"],
            None,
            None,
        )
        .map_err(to_git_error)?;

    let src = Repository::open(source).map_err(to_git_error)?;
    let head = src
        .find_reference("HEAD")
        .map_err(to_git_error)?
        .symbolic_target()
        .map(String::from);
    if let Some(head) = head {
        repo.set_head(&head).map_err(to_git_error)?;
    }

    let mut config = repo.config().map_err(to_git_error)?;
    config
        .set_str("remote.origin.fetch", "+refs/heads/*:refs/heads/*")
        .map_err(to_git_error)?;
    Ok(())
}

#[async_trait]
impl GitClient for MockGitClient {
    async fn clone_repo(
        &self,
        clone_url: &str,
        path: &Path,
        auth_header: Option<&str>,
        _on_progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<(), GitError> {
        self.record("clone", clone_url, path, auth_header);
        self.mirror("clone", clone_url, path, token).await
    }

    async fn fetch(
        &self,
        clone_url: &str,
        path: &Path,
        auth_header: Option<&str>,
        _on_progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<(), GitError> {
        self.record("fetch", clone_url, path, auth_header);
        self.mirror("fetch", clone_url, path, token).await
    }

    async fn is_valid_git_repo_root(&self, path: &Path, token: &CancellationToken) -> bool {
        self.local.is_valid_git_repo_root(path, token).await
    }

    async fn get_branches(&self, path: &Path, token: &CancellationToken) -> Result<Vec<String>, GitError> {
        self.local.get_branches(path, token).await
    }

    async fn get_tags(&self, path: &Path, token: &CancellationToken) -> Result<Vec<String>, GitError> {
        self.local.get_tags(path, token).await
    }

    async fn get_default_branch(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Option<String>, GitError> {
        self.local.get_default_branch(path, token).await
    }

    async fn get_commit_hash(
        &self,
        path: &Path,
        reference: &str,
        token: &CancellationToken,
    ) -> Result<CommitLookup, GitError> {
        self.local.get_commit_hash(path, reference, token).await
    }

    async fn get_latest_commit_timestamp(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, GitError> {
        self.local.get_latest_commit_timestamp(path, token).await
    }

    async fn upsert_git_config(
        &self,
        path: &Path,
        entries: &BTreeMap<String, String>,
        token: &CancellationToken,
    ) -> Result<(), GitError> {
        self.local.upsert_git_config(path, entries, token).await
    }

    async fn unset_git_config(
        &self,
        path: &Path,
        keys: &[&str],
        token: &CancellationToken,
    ) -> Result<(), GitError> {
        self.local.unset_git_config(path, keys, token).await
    }
}

/// One build observed by [`MockIndexBuilder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCall {
    pub repo_id: i64,
    pub repo_path: PathBuf,
    pub revisions: Vec<String>,
}

#[derive(Default)]
struct BuilderState {
    calls: Vec<BuildCall>,
    fail_remaining: usize,
    in_flight: HashMap<i64, usize>,
    max_in_flight: HashMap<i64, usize>,
}

/// Index builder that writes placeholder shards into `index_dir`
///
/// A failing build leaves a `.tmp` shard behind, the way an interrupted
/// `zoekt-git-index` run does.
#[derive(Clone)]
pub struct MockIndexBuilder {
    index_dir: PathBuf,
    hold: Option<Duration>,
    state: Arc<Mutex<BuilderState>>,
}

impl MockIndexBuilder {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            hold: None,
            state: Arc::default(),
        }
    }

    /// Keep every build running for `duration` before it finishes
    pub fn with_hold(mut self, duration: Duration) -> Self {
        self.hold = Some(duration);
        self
    }

    /// Fail the next `count` builds
    pub fn fail_next(&self, count: usize) {
        self.state.lock().unwrap().fail_remaining = count;
    }

    pub fn calls(&self) -> Vec<BuildCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Highest number of simultaneous builds seen for one repository
    pub fn max_concurrent(&self, repo_id: i64) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_in_flight
            .get(&repo_id)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, call: BuildCall) {
        let mut state = self.state.lock().unwrap();
        let repo_id = call.repo_id;
        state.calls.push(call);
        let current = {
            let count = state.in_flight.entry(repo_id).or_default();
            *count += 1;
            *count
        };
        let max = state.max_in_flight.entry(repo_id).or_default();
        *max = (*max).max(current);
    }

    fn exit(&self, repo_id: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.in_flight.get_mut(&repo_id) {
            *count -= 1;
        }
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return true;
        }
        false
    }
}

#[async_trait]
impl IndexBuilder for MockIndexBuilder {
    async fn build_index(
        &self,
        repo: &Repo,
        repo_path: &Path,
        revisions: &[String],
        token: &CancellationToken,
    ) -> Result<(), IndexBuildError> {
        self.enter(BuildCall {
            repo_id: repo.id,
            repo_path: repo_path.to_path_buf(),
            revisions: revisions.to_vec(),
        });

        if let Some(hold) = self.hold {
            tokio::select! {
                () = token.cancelled() => {
                    self.exit(repo.id);
                    return Err(IndexBuildError::Cancelled);
                }
                () = tokio::time::sleep(hold) => {}
            }
        }

        let should_fail = self.exit(repo.id);
        let prefix = shard_prefix(repo.org_id, repo.id);
        std::fs::create_dir_all(&self.index_dir).unwrap();

        if should_fail {
            std::fs::write(
                self.index_dir.join(format!("{prefix}_v16.00000.zoekt.123.tmp")),
                b"partial",
            )
            .unwrap();
            return Err(IndexBuildError::Failed {
                repo_id: repo.id,
                status: "exit status: 1".to_string(),
            });
        }

        std::fs::write(
            self.index_dir.join(format!("{prefix}_v16.00000.zoekt")),
            revisions.join("\n"),
        )
        .unwrap();
        Ok(())
    }
}

/// Metrics sink that keeps running totals per metric, repo and job type
#[derive(Clone, Default)]
pub struct RecordingJobMetrics {
    values: Arc<Mutex<HashMap<(&'static str, String, JobType), f64>>>,
}

impl RecordingJobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value; unknown series read as zero
    pub fn value(&self, metric: &str, repo: &str, job_type: JobType) -> f64 {
        self.values
            .lock()
            .unwrap()
            .iter()
            .find(|((m, r, t), _)| *m == metric && r == repo && *t == job_type)
            .map_or(0.0, |(_, v)| *v)
    }

    fn add(&self, metric: &'static str, repo: &str, job_type: JobType, delta: f64) {
        *self
            .values
            .lock()
            .unwrap()
            .entry((metric, repo.to_string(), job_type))
            .or_default() += delta;
    }
}

impl JobMetrics for RecordingJobMetrics {
    fn adjust_pending(&self, repo: &str, job_type: JobType, delta: f64) {
        self.add(PENDING_JOBS, repo, job_type, delta);
    }

    fn adjust_active(&self, repo: &str, job_type: JobType, delta: f64) {
        self.add(ACTIVE_JOBS, repo, job_type, delta);
    }

    fn record_success(&self, repo: &str, job_type: JobType) {
        self.add(JOB_SUCCESS_TOTAL, repo, job_type, 1.0);
    }

    fn record_failure(&self, repo: &str, job_type: JobType) {
        self.add(JOB_FAIL_TOTAL, repo, job_type, 1.0);
    }

    fn record_reattempt(&self, repo: &str, job_type: JobType) {
        self.add(JOB_REATTEMPTS_TOTAL, repo, job_type, 1.0);
    }
}

/// Event sink that keeps every captured event in order
#[derive(Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(Event::name).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn capture(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repoweaver_test_utils::GitFixture;

    #[tokio::test]
    async fn test_mock_clone_mirrors_branches_and_tags() {
        let source = GitFixture::new();
        source.commit("README.md", "hello", "initial");
        source.branch("release/1.0");
        source.tag("v1.0");

        let target = tempfile::TempDir::new().unwrap();
        let path = target.path().join("7");
        let client = MockGitClient::new().with_remote("https://example.com/r.git", source.path());
        let token = CancellationToken::new();

        client
            .clone_repo("https://example.com/r.git", &path, None, None, &token)
            .await
            .unwrap();

        let mut branches = client.get_branches(&path, &token).await.unwrap();
        branches.sort();
        assert_eq!(branches, vec!["main".to_string(), "release/1.0".to_string()]);
        assert_eq!(client.get_tags(&path, &token).await.unwrap(), vec!["v1.0".to_string()]);
        assert_eq!(
            client.get_commit_hash(&path, "HEAD", &token).await.unwrap(),
            CommitLookup::Found(source.head_hash())
        );
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_remote_fails_like_git() {
        let target = tempfile::TempDir::new().unwrap();
        let client = MockGitClient::new();
        let result = client
            .clone_repo(
                "https://example.com/missing.git",
                &target.path().join("1"),
                None,
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(GitError::CommandFailed { .. })));
    }

    #[test]
    fn test_recording_metrics_accumulate() {
        let metrics = RecordingJobMetrics::new();
        metrics.adjust_pending("r", JobType::Index, 1.0);
        metrics.adjust_pending("r", JobType::Index, -1.0);
        metrics.adjust_active("r", JobType::Index, 1.0);
        assert!(metrics.value(PENDING_JOBS, "r", JobType::Index).abs() < f64::EPSILON);
        assert!((metrics.value(ACTIVE_JOBS, "r", JobType::Index) - 1.0).abs() < f64::EPSILON);
        assert!(metrics.value(ACTIVE_JOBS, "r", JobType::Cleanup).abs() < f64::EPSILON);
    }
}
