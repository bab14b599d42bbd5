//! In-memory implementation of [`RepoStore`] for testing
//!
//! Mirrors the SQL semantics of `DbRepoStore`, including the guarded status
//! transitions and the scheduling filters, so orchestration logic can be
//! exercised without a database.

// Allow test-specific patterns in mock implementation
#![allow(clippy::unwrap_used)] // Mocks can panic on lock poisoning
#![allow(clippy::arithmetic_side_effects)] // Test counters can overflow
#![allow(clippy::significant_drop_tightening)] // Mock locks don't need optimization

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{DatabaseError, DatabaseOperation, DatabaseResult};
use crate::models::{
    Connection, IndexSuccess, JobMetadata, JobStatus, JobTransition, JobType, NewRepo, Repo,
    RepoIndexingJob, RepoIndexingStatus, UpsertOutcome,
};
use crate::repository::window_start;
use crate::traits::RepoStore;

#[derive(Default)]
struct MockState {
    repos: HashMap<i64, Repo>,
    jobs: HashMap<Uuid, RepoIndexingJob>,
    connections: HashMap<i64, Connection>,
    /// (`repo_id`, `connection_id`)
    links: BTreeSet<(i64, i64)>,
    next_repo_id: i64,
    next_connection_id: i64,
}

/// Mock repository store for testing
#[derive(Clone, Default)]
pub struct MockRepoStore {
    state: Arc<Mutex<MockState>>,

    // Behavior controls for testing
    should_fail_next: Arc<Mutex<bool>>,
    error_message: Arc<Mutex<String>>,
    failing_operation: Arc<Mutex<Option<&'static str>>>,
}

impl MockRepoStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure to fail on next operation
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned
    pub fn fail_next(&self, message: &str) {
        *self.should_fail_next.lock().unwrap() = true;
        *self.error_message.lock().unwrap() = message.to_string();
    }

    /// Configure the next call of `operation` (a `RepoStore` method name) to fail
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned
    pub fn fail_operation(&self, operation: &'static str, message: &str) {
        *self.failing_operation.lock().unwrap() = Some(operation);
        *self.error_message.lock().unwrap() = message.to_string();
    }

    /// Check if should fail and reset
    fn check_fail(&self) -> DatabaseResult<()> {
        let mut should_fail = self.should_fail_next.lock().unwrap();
        if *should_fail {
            *should_fail = false;
            return Err(self.injected_error());
        }
        Ok(())
    }

    /// Like `check_fail`, plus a failure armed for this operation only
    fn check_fail_for(&self, operation: &'static str) -> DatabaseResult<()> {
        self.check_fail()?;
        let mut failing = self.failing_operation.lock().unwrap();
        if *failing == Some(operation) {
            *failing = None;
            return Err(self.injected_error());
        }
        Ok(())
    }

    fn injected_error(&self) -> DatabaseError {
        DatabaseError::UnexpectedState {
            operation: Box::new(DatabaseOperation::Query {
                description: "mock operation".to_string(),
            }),
            message: self.error_message.lock().unwrap().clone(),
            correlation_id: None,
        }
    }

    /// Insert a repository directly, bypassing connection sync
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned
    pub fn insert_repo(&self, new_repo: &NewRepo) -> Repo {
        let mut state = self.state.lock().unwrap();
        insert_repo_locked(&mut state, new_repo)
    }

    /// Link a repository to a connection
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned
    pub fn link(&self, repo_id: i64, connection_id: i64) {
        self.state
            .lock()
            .unwrap()
            .links
            .insert((repo_id, connection_id));
    }

    /// Overwrite a repository row
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned
    pub fn update_repo(&self, repo_id: i64, f: impl FnOnce(&mut Repo)) {
        if let Some(repo) = self.state.lock().unwrap().repos.get_mut(&repo_id) {
            f(repo);
        }
    }

    /// Overwrite a job row
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned
    pub fn update_job(&self, job_id: Uuid, f: impl FnOnce(&mut RepoIndexingJob)) {
        if let Some(job) = self.state.lock().unwrap().jobs.get_mut(&job_id) {
            f(job);
        }
    }

    /// Current repository row
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned
    pub fn repo(&self, repo_id: i64) -> Option<Repo> {
        self.state.lock().unwrap().repos.get(&repo_id).cloned()
    }

    /// Current job row
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned
    pub fn job(&self, job_id: Uuid) -> Option<RepoIndexingJob> {
        self.state.lock().unwrap().jobs.get(&job_id).cloned()
    }

    /// All jobs for a repository, oldest first
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned
    pub fn jobs_for_repo(&self, repo_id: i64) -> Vec<RepoIndexingJob> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.repo_id == repo_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Repository ids linked to a connection
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned
    pub fn linked_repos(&self, connection_id: i64) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|(_, c)| *c == connection_id)
            .map(|(r, _)| *r)
            .collect()
    }

    fn transition(
        &self,
        job_id: Uuid,
        next: JobStatus,
        error_message: Option<&str>,
    ) -> DatabaseResult<Option<JobTransition>> {
        self.check_fail()?;
        let mut state = self.state.lock().unwrap();

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        let previous_status = job.status;
        if previous_status.is_terminal() {
            return Ok(None);
        }

        let now = Utc::now();
        job.status = next;
        job.updated_at = now;
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        if next.is_terminal() {
            job.completed_at = Some(now);
        }
        let job = job.clone();

        let Some(repo) = state.repos.get_mut(&job.repo_id) else {
            return Err(DatabaseError::not_found(
                "repo",
                job.repo_id,
                DatabaseOperation::GetRepo {
                    repo_id: job.repo_id,
                },
            ));
        };
        repo.latest_indexing_job_status = Some(next);
        if next != JobStatus::Completed
            && let Some(status) = RepoIndexingStatus::from_job(job.job_type, next)
        {
            repo.indexing_status = status;
        }
        repo.updated_at = now;

        Ok(Some(JobTransition {
            previous_status,
            job,
            repo: repo.clone(),
        }))
    }
}

fn insert_repo_locked(state: &mut MockState, new_repo: &NewRepo) -> Repo {
    state.next_repo_id += 1;
    let now = Utc::now();
    let repo = Repo {
        id: state.next_repo_id,
        org_id: new_repo.org_id,
        name: new_repo.name.clone(),
        display_name: new_repo.display_name.clone(),
        clone_url: new_repo.clone_url.clone(),
        web_url: new_repo.web_url.clone(),
        image_url: new_repo.image_url.clone(),
        default_branch: new_repo.default_branch.clone(),
        is_fork: new_repo.is_fork,
        is_archived: new_repo.is_archived,
        is_public: new_repo.is_public,
        is_auto_cleanup_disabled: false,
        size_bytes: new_repo.size_bytes,
        metadata: new_repo.metadata.clone(),
        external_id: new_repo.external_id.clone(),
        external_code_host_type: new_repo.external_code_host_type.clone(),
        external_code_host_url: new_repo.external_code_host_url.clone(),
        indexing_status: RepoIndexingStatus::New,
        latest_indexing_job_status: None,
        indexed_at: None,
        indexed_commit_hash: None,
        pushed_at: None,
        created_at: now,
        updated_at: now,
    };
    state.repos.insert(repo.id, repo.clone());
    repo
}

fn has_job(
    state: &MockState,
    repo_id: i64,
    job_type: JobType,
    predicate: impl Fn(&RepoIndexingJob) -> bool,
) -> bool {
    state
        .jobs
        .values()
        .any(|j| j.repo_id == repo_id && j.job_type == job_type && predicate(j))
}

#[async_trait]
impl RepoStore for MockRepoStore {
    async fn find_index_candidates(
        &self,
        now: DateTime<Utc>,
        reindex_interval: Duration,
        job_timeout: Duration,
    ) -> DatabaseResult<Vec<Repo>> {
        self.check_fail()?;
        let threshold = window_start(now, reindex_interval);
        let timeout = window_start(now, job_timeout);
        let state = self.state.lock().unwrap();

        let mut repos: Vec<Repo> = state
            .repos
            .values()
            .filter(|r| r.indexed_at.is_none_or(|at| at < threshold))
            .filter(|r| {
                !has_job(&state, r.id, JobType::Index, |j| {
                    (j.status.is_active() && j.created_at > timeout)
                        || (j.status == JobStatus::Failed
                            && j.completed_at.is_some_and(|at| at > threshold))
                })
            })
            .cloned()
            .collect();
        repos.sort_by_key(|r| (r.indexed_at, r.id));
        Ok(repos)
    }

    async fn find_cleanup_candidates(
        &self,
        now: DateTime<Utc>,
        grace_period: Duration,
        job_timeout: Duration,
    ) -> DatabaseResult<Vec<Repo>> {
        self.check_fail()?;
        let grace = window_start(now, grace_period);
        let timeout = window_start(now, job_timeout);
        let state = self.state.lock().unwrap();

        let mut repos: Vec<Repo> = state
            .repos
            .values()
            .filter(|r| !state.links.iter().any(|(repo_id, _)| *repo_id == r.id))
            .filter(|r| !r.is_auto_cleanup_disabled)
            .filter(|r| r.indexed_at.is_none_or(|at| at < grace))
            .filter(|r| {
                !has_job(&state, r.id, JobType::Cleanup, |j| {
                    j.status.is_active() && j.created_at > timeout
                })
            })
            .cloned()
            .collect();
        repos.sort_by_key(|r| r.id);
        Ok(repos)
    }

    async fn create_jobs(
        &self,
        repos: &[Repo],
        job_type: JobType,
    ) -> DatabaseResult<Vec<RepoIndexingJob>> {
        self.check_fail()?;
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut created = Vec::with_capacity(repos.len());

        for repo in repos {
            let job = RepoIndexingJob {
                id: Uuid::new_v4(),
                job_type,
                repo_id: repo.id,
                status: JobStatus::Pending,
                metadata: JobMetadata::default(),
                error_message: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            };
            state.jobs.insert(job.id, job.clone());

            if let Some(stored) = state.repos.get_mut(&repo.id) {
                stored.latest_indexing_job_status = Some(JobStatus::Pending);
                if let Some(status) = RepoIndexingStatus::from_job(job_type, JobStatus::Pending) {
                    stored.indexing_status = status;
                }
            }
            created.push(job);
        }
        Ok(created)
    }

    async fn get_job(&self, job_id: Uuid) -> DatabaseResult<Option<RepoIndexingJob>> {
        self.check_fail()?;
        Ok(self.job(job_id))
    }

    async fn get_repo(&self, repo_id: i64) -> DatabaseResult<Option<Repo>> {
        self.check_fail()?;
        Ok(self.repo(repo_id))
    }

    async fn start_job(&self, job_id: Uuid) -> DatabaseResult<Option<JobTransition>> {
        self.transition(job_id, JobStatus::InProgress, None)
    }

    async fn set_job_metadata(&self, job_id: Uuid, metadata: &JobMetadata) -> DatabaseResult<()> {
        self.check_fail()?;
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(&job_id).ok_or_else(|| {
            DatabaseError::not_found("job", job_id, DatabaseOperation::SetJobMetadata { job_id })
        })?;
        job.metadata = metadata.clone();
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid) -> DatabaseResult<Option<JobTransition>> {
        self.transition(job_id, JobStatus::Completed, None)
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error_message: &str,
    ) -> DatabaseResult<Option<JobTransition>> {
        self.transition(job_id, JobStatus::Failed, Some(error_message))
    }

    async fn record_index_success(
        &self,
        repo_id: i64,
        success: &IndexSuccess,
        now: DateTime<Utc>,
    ) -> DatabaseResult<()> {
        self.check_fail_for("record_index_success")?;
        let mut state = self.state.lock().unwrap();
        let repo = state.repos.get_mut(&repo_id).ok_or_else(|| {
            DatabaseError::not_found(
                "repo",
                repo_id,
                DatabaseOperation::RecordIndexSuccess { repo_id },
            )
        })?;

        repo.indexed_at = Some(now);
        repo.indexed_commit_hash.clone_from(&success.indexed_commit_hash);
        if success.pushed_at.is_some() {
            repo.pushed_at = success.pushed_at;
        }
        if success.default_branch.is_some() {
            repo.default_branch.clone_from(&success.default_branch);
        }
        repo.metadata.indexed_revisions = Some(success.indexed_revisions.clone());
        repo.indexing_status = RepoIndexingStatus::Indexed;
        repo.updated_at = now;
        Ok(())
    }

    async fn delete_repo(&self, repo_id: i64) -> DatabaseResult<bool> {
        self.check_fail_for("delete_repo")?;
        let mut state = self.state.lock().unwrap();
        let removed = state.repos.remove(&repo_id).is_some();
        state.jobs.retain(|_, j| j.repo_id != repo_id);
        state.links.retain(|(r, _)| *r != repo_id);
        Ok(removed)
    }

    async fn upsert_connection(
        &self,
        org_id: i32,
        name: &str,
        connection_type: &str,
        config: &serde_json::Value,
    ) -> DatabaseResult<i64> {
        self.check_fail()?;
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state
            .connections
            .values_mut()
            .find(|c| c.org_id == org_id && c.name == name)
        {
            if existing.config != *config {
                existing.synced_at = None;
            }
            existing.connection_type = connection_type.to_string();
            existing.config = config.clone();
            return Ok(existing.id);
        }

        state.next_connection_id += 1;
        let connection = Connection {
            id: state.next_connection_id,
            org_id,
            name: name.to_string(),
            connection_type: connection_type.to_string(),
            config: config.clone(),
            synced_at: None,
        };
        let id = connection.id;
        state.connections.insert(id, connection);
        Ok(id)
    }

    async fn upsert_repos(
        &self,
        connection_id: i64,
        repos: &[NewRepo],
    ) -> DatabaseResult<UpsertOutcome> {
        self.check_fail()?;
        let mut state = self.state.lock().unwrap();
        let mut outcome = UpsertOutcome::default();
        let mut linked = Vec::with_capacity(repos.len());

        for new_repo in repos {
            let existing = state
                .repos
                .values_mut()
                .find(|r| {
                    r.external_id == new_repo.external_id
                        && r.external_code_host_url == new_repo.external_code_host_url
                        && r.org_id == new_repo.org_id
                });

            let repo_id = if let Some(repo) = existing {
                let indexed_revisions = repo.metadata.indexed_revisions.take();
                repo.name.clone_from(&new_repo.name);
                repo.display_name.clone_from(&new_repo.display_name);
                repo.clone_url.clone_from(&new_repo.clone_url);
                repo.web_url.clone_from(&new_repo.web_url);
                repo.metadata = new_repo.metadata.clone();
                repo.metadata.indexed_revisions = indexed_revisions;
                repo.updated_at = Utc::now();
                outcome.updated += 1;
                repo.id
            } else {
                let repo = insert_repo_locked(&mut state, new_repo);
                let id = repo.id;
                outcome.created.push(repo);
                id
            };

            state.links.insert((repo_id, connection_id));
            linked.push(repo_id);
        }

        let before = state.links.len();
        state
            .links
            .retain(|(r, c)| *c != connection_id || linked.contains(r));
        outcome.unlinked = before - state.links.len();

        Ok(outcome)
    }

    async fn connections_due_for_sync(
        &self,
        now: DateTime<Utc>,
        resync_interval: Duration,
    ) -> DatabaseResult<Vec<Connection>> {
        self.check_fail()?;
        let threshold = window_start(now, resync_interval);
        let state = self.state.lock().unwrap();
        let mut due: Vec<Connection> = state
            .connections
            .values()
            .filter(|c| c.synced_at.is_none_or(|at| at < threshold))
            .cloned()
            .collect();
        due.sort_by_key(|c| (c.synced_at, c.id));
        Ok(due)
    }

    async fn mark_connection_synced(
        &self,
        connection_id: i64,
        synced_at: DateTime<Utc>,
    ) -> DatabaseResult<()> {
        self.check_fail()?;
        if let Some(connection) = self
            .state
            .lock()
            .unwrap()
            .connections
            .get_mut(&connection_id)
        {
            connection.synced_at = Some(synced_at);
        }
        Ok(())
    }
}
