//! Repository store trait for dependency injection and testing

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::DatabaseResult;
use crate::models::{
    Connection, IndexSuccess, JobMetadata, JobTransition, JobType, NewRepo, Repo,
    RepoIndexingJob, UpsertOutcome,
};

/// All database operations the orchestrator performs
#[async_trait]
pub trait RepoStore: Send + Sync {
    /// Repositories due for (re)indexing
    ///
    /// Selects repos never indexed or indexed before `now - reindex_interval`
    /// that have no INDEX job PENDING/IN_PROGRESS created after
    /// `now - job_timeout`, and no INDEX job FAILED after
    /// `now - reindex_interval`.
    async fn find_index_candidates(
        &self,
        now: DateTime<Utc>,
        reindex_interval: Duration,
        job_timeout: Duration,
    ) -> DatabaseResult<Vec<Repo>>;

    /// Repositories with no connections left, past the grace period, with
    /// auto cleanup enabled and no recent active CLEANUP job
    async fn find_cleanup_candidates(
        &self,
        now: DateTime<Utc>,
        grace_period: Duration,
        job_timeout: Duration,
    ) -> DatabaseResult<Vec<Repo>>;

    /// Insert one PENDING job per repo and mirror the queued status onto each repo
    async fn create_jobs(
        &self,
        repos: &[Repo],
        job_type: JobType,
    ) -> DatabaseResult<Vec<RepoIndexingJob>>;

    async fn get_job(&self, job_id: Uuid) -> DatabaseResult<Option<RepoIndexingJob>>;

    async fn get_repo(&self, repo_id: i64) -> DatabaseResult<Option<Repo>>;

    /// Move a PENDING or IN_PROGRESS job to IN_PROGRESS and mirror it onto the repo
    ///
    /// Returns `None` if the job is missing or already terminal.
    async fn start_job(&self, job_id: Uuid) -> DatabaseResult<Option<JobTransition>>;

    async fn set_job_metadata(&self, job_id: Uuid, metadata: &JobMetadata) -> DatabaseResult<()>;

    /// Mark an active job COMPLETED and mirror `latest_indexing_job_status`
    ///
    /// The repo's `indexing_status` is left for [`RepoStore::record_index_success`].
    /// Returns `None` if the job is missing or already terminal.
    async fn complete_job(&self, job_id: Uuid) -> DatabaseResult<Option<JobTransition>>;

    /// Mark an active job FAILED and mirror FAILED / GARBAGE_COLLECTION_FAILED
    ///
    /// Returns `None` if the job is missing or already terminal.
    async fn fail_job(
        &self,
        job_id: Uuid,
        error_message: &str,
    ) -> DatabaseResult<Option<JobTransition>>;

    /// Stamp `indexed_at`, commit hash and metadata, and set the repo INDEXED
    async fn record_index_success(
        &self,
        repo_id: i64,
        success: &IndexSuccess,
        now: DateTime<Utc>,
    ) -> DatabaseResult<()>;

    /// Delete the repository row; returns false if it was already gone
    async fn delete_repo(&self, repo_id: i64) -> DatabaseResult<bool>;

    /// Create or update a configured connection, returning its id
    async fn upsert_connection(
        &self,
        org_id: i32,
        name: &str,
        connection_type: &str,
        config: &serde_json::Value,
    ) -> DatabaseResult<i64>;

    /// Upsert discovered repositories and make them the connection's only links
    async fn upsert_repos(
        &self,
        connection_id: i64,
        repos: &[NewRepo],
    ) -> DatabaseResult<UpsertOutcome>;

    /// Connections never synced or synced before `now - resync_interval`
    async fn connections_due_for_sync(
        &self,
        now: DateTime<Utc>,
        resync_interval: Duration,
    ) -> DatabaseResult<Vec<Connection>>;

    async fn mark_connection_synced(
        &self,
        connection_id: i64,
        synced_at: DateTime<Utc>,
    ) -> DatabaseResult<()>;
}
