//! `PostgreSQL` implementation of [`RepoStore`]
//!
//! Scheduling scans run on the analytics pool, lookups on the read pool and
//! every state transition on the write pool. A job status change and its
//! repository mirror always commit in the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{DatabaseError, DatabaseErrorExt, DatabaseOperation, DatabaseResult};
use crate::models::{
    Connection, IndexSuccess, JobMetadata, JobStatus, JobTransition, JobType, NewRepo, Repo,
    RepoIndexingJob, RepoIndexingStatus, RepoMetadata, UpsertOutcome,
};
use crate::pool_manager::PoolManager;
use crate::traits::RepoStore;

/// `now - window`, saturating at the earliest representable instant
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn decode_err(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

pub(crate) fn repo_from_row(row: &PgRow) -> Result<Repo, sqlx::Error> {
    let indexing_status: String = row.try_get("indexing_status")?;
    let latest_status: Option<String> = row.try_get("latest_indexing_job_status")?;
    let metadata: Json<RepoMetadata> = row.try_get("metadata")?;

    Ok(Repo {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        clone_url: row.try_get("clone_url")?,
        web_url: row.try_get("web_url")?,
        image_url: row.try_get("image_url")?,
        default_branch: row.try_get("default_branch")?,
        is_fork: row.try_get("is_fork")?,
        is_archived: row.try_get("is_archived")?,
        is_public: row.try_get("is_public")?,
        is_auto_cleanup_disabled: row.try_get("is_auto_cleanup_disabled")?,
        size_bytes: row.try_get("size_bytes")?,
        metadata: metadata.0,
        external_id: row.try_get("external_id")?,
        external_code_host_type: row.try_get("external_code_host_type")?,
        external_code_host_url: row.try_get("external_code_host_url")?,
        indexing_status: indexing_status.parse().map_err(decode_err)?,
        latest_indexing_job_status: latest_status
            .map(|s| s.parse::<JobStatus>())
            .transpose()
            .map_err(decode_err)?,
        indexed_at: row.try_get("indexed_at")?,
        indexed_commit_hash: row.try_get("indexed_commit_hash")?,
        pushed_at: row.try_get("pushed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<RepoIndexingJob, sqlx::Error> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    let metadata: Json<JobMetadata> = row.try_get("metadata")?;

    Ok(RepoIndexingJob {
        id: row.try_get("id")?,
        job_type: job_type.parse().map_err(decode_err)?,
        repo_id: row.try_get("repo_id")?,
        status: status.parse().map_err(decode_err)?,
        metadata: metadata.0,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn connection_from_row(row: &PgRow) -> Result<Connection, sqlx::Error> {
    Ok(Connection {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        name: row.try_get("name")?,
        connection_type: row.try_get("connection_type")?,
        config: row.try_get("config")?,
        synced_at: row.try_get("synced_at")?,
    })
}

/// Repository store backed by the pooled `PostgreSQL` connections
pub struct DbRepoStore {
    pools: PoolManager,
}

impl DbRepoStore {
    pub const fn new(pools: PoolManager) -> Self {
        Self { pools }
    }

    /// Apply a guarded status change and mirror it onto the repository
    ///
    /// Only PENDING and IN_PROGRESS jobs may move, so a terminal job is
    /// never reopened or overwritten.
    async fn transition(
        &self,
        job_id: Uuid,
        next: JobStatus,
        error_message: Option<&str>,
        operation: DatabaseOperation,
    ) -> DatabaseResult<Option<JobTransition>> {
        let mut tx = self
            .pools
            .write_pool()
            .begin()
            .await
            .map_db_err(operation.clone(), None)?;

        let current = sqlx::query(
            r"
            SELECT status FROM repo_indexing_jobs
            WHERE id = $1
            FOR UPDATE
            ",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_db_err(operation.clone(), None)?;

        let Some(current) = current else {
            return Ok(None);
        };
        let previous_status: JobStatus = current
            .try_get::<String, _>("status")
            .map_err(|e| DatabaseError::query_failed(operation.clone(), e, None))?
            .parse()
            .map_err(|message| DatabaseError::UnexpectedState {
                operation: Box::new(operation.clone()),
                message,
                correlation_id: None,
            })?;

        if previous_status.is_terminal() {
            return Ok(None);
        }

        let job_row = sqlx::query(
            r"
            UPDATE repo_indexing_jobs
            SET status = $2,
                error_message = COALESCE($3, error_message),
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(job_id)
        .bind(next.as_str())
        .bind(error_message)
        .bind(next.is_terminal())
        .fetch_one(&mut *tx)
        .await
        .map_db_err(operation.clone(), None)?;
        let job = job_from_row(&job_row).map_db_err(operation.clone(), None)?;

        let repo = Self::mirror_status(&mut tx, &job, next, &operation).await?;

        tx.commit().await.map_db_err(operation, None)?;

        Ok(Some(JobTransition {
            previous_status,
            job,
            repo,
        }))
    }

    async fn mirror_status(
        tx: &mut Transaction<'_, Postgres>,
        job: &RepoIndexingJob,
        status: JobStatus,
        operation: &DatabaseOperation,
    ) -> DatabaseResult<Repo> {
        // INDEXED is only written once the success path has stamped the repo
        let repo_status = match status {
            JobStatus::Completed => None,
            _ => RepoIndexingStatus::from_job(job.job_type, status),
        };

        let row = sqlx::query(
            r"
            UPDATE repos
            SET latest_indexing_job_status = $2,
                indexing_status = COALESCE($3::text, indexing_status),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(job.repo_id)
        .bind(status.as_str())
        .bind(repo_status.map(RepoIndexingStatus::as_str))
        .fetch_optional(&mut **tx)
        .await
        .map_db_err(operation.clone(), None)?
        .ok_or_else(|| DatabaseError::not_found("repo", job.repo_id, operation.clone()))?;

        repo_from_row(&row).map_db_err(operation.clone(), None)
    }
}

#[async_trait]
impl RepoStore for DbRepoStore {
    async fn find_index_candidates(
        &self,
        now: DateTime<Utc>,
        reindex_interval: Duration,
        job_timeout: Duration,
    ) -> DatabaseResult<Vec<Repo>> {
        let pool = self.pools.analytics_pool();
        let operation = DatabaseOperation::FindIndexCandidates;

        let rows = sqlx::query(
            r"
            SELECT r.*
            FROM repos r
            WHERE (r.indexed_at IS NULL OR r.indexed_at < $1)
              AND NOT EXISTS (
                  SELECT 1
                  FROM repo_indexing_jobs j
                  WHERE j.repo_id = r.id
                    AND j.job_type = 'INDEX'
                    AND (
                        (j.status IN ('PENDING', 'IN_PROGRESS') AND j.created_at > $2)
                        OR (j.status = 'FAILED' AND j.completed_at > $1)
                    )
              )
            ORDER BY r.indexed_at ASC NULLS FIRST, r.id
            ",
        )
        .bind(window_start(now, reindex_interval))
        .bind(window_start(now, job_timeout))
        .fetch_all(pool)
        .await
        .map_db_err(operation.clone(), None)?;

        rows.iter()
            .map(repo_from_row)
            .collect::<Result<_, _>>()
            .map_db_err(operation, None)
    }

    async fn find_cleanup_candidates(
        &self,
        now: DateTime<Utc>,
        grace_period: Duration,
        job_timeout: Duration,
    ) -> DatabaseResult<Vec<Repo>> {
        let pool = self.pools.analytics_pool();
        let operation = DatabaseOperation::FindCleanupCandidates;

        let rows = sqlx::query(
            r"
            SELECT r.*
            FROM repos r
            WHERE NOT EXISTS (SELECT 1 FROM repo_to_connection rc WHERE rc.repo_id = r.id)
              AND NOT r.is_auto_cleanup_disabled
              AND (r.indexed_at IS NULL OR r.indexed_at < $1)
              AND NOT EXISTS (
                  SELECT 1
                  FROM repo_indexing_jobs j
                  WHERE j.repo_id = r.id
                    AND j.job_type = 'CLEANUP'
                    AND j.status IN ('PENDING', 'IN_PROGRESS')
                    AND j.created_at > $2
              )
            ORDER BY r.id
            ",
        )
        .bind(window_start(now, grace_period))
        .bind(window_start(now, job_timeout))
        .fetch_all(pool)
        .await
        .map_db_err(operation.clone(), None)?;

        rows.iter()
            .map(repo_from_row)
            .collect::<Result<_, _>>()
            .map_db_err(operation, None)
    }

    async fn create_jobs(
        &self,
        repos: &[Repo],
        job_type: JobType,
    ) -> DatabaseResult<Vec<RepoIndexingJob>> {
        if repos.is_empty() {
            return Ok(Vec::new());
        }

        let operation = DatabaseOperation::CreateJobs {
            job_type: job_type.to_string(),
            count: repos.len(),
        };

        let job_ids: Vec<Uuid> = repos.iter().map(|_| Uuid::new_v4()).collect();
        let repo_ids: Vec<i64> = repos.iter().map(|r| r.id).collect();
        let queued_status = RepoIndexingStatus::from_job(job_type, JobStatus::Pending)
            .map(RepoIndexingStatus::as_str);

        let mut tx = self
            .pools
            .write_pool()
            .begin()
            .await
            .map_db_err(operation.clone(), None)?;

        let rows = sqlx::query(
            r"
            INSERT INTO repo_indexing_jobs (id, job_type, repo_id, status)
            SELECT t.id, $3, t.repo_id, 'PENDING'
            FROM UNNEST($1::uuid[], $2::bigint[]) AS t(id, repo_id)
            RETURNING *
            ",
        )
        .bind(&job_ids)
        .bind(&repo_ids)
        .bind(job_type.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_db_err(operation.clone(), None)?;

        sqlx::query(
            r"
            UPDATE repos
            SET latest_indexing_job_status = 'PENDING',
                indexing_status = COALESCE($2::text, indexing_status),
                updated_at = NOW()
            WHERE id = ANY($1)
            ",
        )
        .bind(&repo_ids)
        .bind(queued_status)
        .execute(&mut *tx)
        .await
        .map_db_err(operation.clone(), None)?;

        tx.commit().await.map_db_err(operation.clone(), None)?;

        rows.iter()
            .map(job_from_row)
            .collect::<Result<_, _>>()
            .map_db_err(operation, None)
    }

    async fn get_job(&self, job_id: Uuid) -> DatabaseResult<Option<RepoIndexingJob>> {
        let pool = self.pools.read_pool();
        let operation = DatabaseOperation::GetJob { job_id };

        let row = sqlx::query("SELECT * FROM repo_indexing_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(pool)
            .await
            .map_db_err(operation.clone(), None)?;

        row.as_ref()
            .map(job_from_row)
            .transpose()
            .map_db_err(operation, None)
    }

    async fn get_repo(&self, repo_id: i64) -> DatabaseResult<Option<Repo>> {
        let pool = self.pools.read_pool();
        let operation = DatabaseOperation::GetRepo { repo_id };

        let row = sqlx::query("SELECT * FROM repos WHERE id = $1")
            .bind(repo_id)
            .fetch_optional(pool)
            .await
            .map_db_err(operation.clone(), None)?;

        row.as_ref()
            .map(repo_from_row)
            .transpose()
            .map_db_err(operation, None)
    }

    async fn start_job(&self, job_id: Uuid) -> DatabaseResult<Option<JobTransition>> {
        self.transition(
            job_id,
            JobStatus::InProgress,
            None,
            DatabaseOperation::StartJob { job_id },
        )
        .await
    }

    async fn set_job_metadata(&self, job_id: Uuid, metadata: &JobMetadata) -> DatabaseResult<()> {
        let pool = self.pools.write_pool();
        let operation = DatabaseOperation::SetJobMetadata { job_id };

        let result = sqlx::query(
            r"
            UPDATE repo_indexing_jobs
            SET metadata = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(Json(metadata))
        .execute(pool)
        .await
        .map_db_err(operation.clone(), None)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("job", job_id, operation));
        }
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid) -> DatabaseResult<Option<JobTransition>> {
        self.transition(
            job_id,
            JobStatus::Completed,
            None,
            DatabaseOperation::CompleteJob { job_id },
        )
        .await
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error_message: &str,
    ) -> DatabaseResult<Option<JobTransition>> {
        self.transition(
            job_id,
            JobStatus::Failed,
            Some(error_message),
            DatabaseOperation::FailJob { job_id },
        )
        .await
    }

    async fn record_index_success(
        &self,
        repo_id: i64,
        success: &IndexSuccess,
        now: DateTime<Utc>,
    ) -> DatabaseResult<()> {
        let pool = self.pools.write_pool();
        let operation = DatabaseOperation::RecordIndexSuccess { repo_id };

        let revisions = serde_json::json!({ "indexedRevisions": success.indexed_revisions });

        let result = sqlx::query(
            r"
            UPDATE repos
            SET indexed_at = $2,
                indexed_commit_hash = $3,
                pushed_at = COALESCE($4, pushed_at),
                default_branch = COALESCE($5, default_branch),
                metadata = metadata || $6::jsonb,
                indexing_status = 'INDEXED',
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(repo_id)
        .bind(now)
        .bind(&success.indexed_commit_hash)
        .bind(success.pushed_at)
        .bind(&success.default_branch)
        .bind(revisions)
        .execute(pool)
        .await
        .map_db_err(operation.clone(), None)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("repo", repo_id, operation));
        }
        Ok(())
    }

    async fn delete_repo(&self, repo_id: i64) -> DatabaseResult<bool> {
        let pool = self.pools.write_pool();
        let operation = DatabaseOperation::DeleteRepo { repo_id };

        let result = sqlx::query("DELETE FROM repos WHERE id = $1")
            .bind(repo_id)
            .execute(pool)
            .await
            .map_db_err(operation, None)?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_connection(
        &self,
        org_id: i32,
        name: &str,
        connection_type: &str,
        config: &serde_json::Value,
    ) -> DatabaseResult<i64> {
        let pool = self.pools.write_pool();
        let operation = DatabaseOperation::Query {
            description: format!("upsert_connection(org={org_id}, name={name})"),
        };

        // A changed config forces a resync on the next syncer tick
        let row = sqlx::query(
            r"
            INSERT INTO connections (org_id, name, connection_type, config)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (org_id, name) DO UPDATE
            SET connection_type = EXCLUDED.connection_type,
                config = EXCLUDED.config,
                synced_at = CASE
                    WHEN connections.config IS DISTINCT FROM EXCLUDED.config THEN NULL
                    ELSE connections.synced_at
                END,
                updated_at = NOW()
            RETURNING id
            ",
        )
        .bind(org_id)
        .bind(name)
        .bind(connection_type)
        .bind(config)
        .fetch_one(pool)
        .await
        .map_db_err(operation.clone(), None)?;

        row.try_get("id").map_db_err(operation, None)
    }

    async fn upsert_repos(
        &self,
        connection_id: i64,
        repos: &[NewRepo],
    ) -> DatabaseResult<UpsertOutcome> {
        let operation = DatabaseOperation::UpsertRepos {
            connection_id,
            count: repos.len(),
        };

        let mut tx = self
            .pools
            .write_pool()
            .begin()
            .await
            .map_db_err(operation.clone(), None)?;

        let mut outcome = UpsertOutcome::default();
        let mut linked_ids = Vec::with_capacity(repos.len());

        for repo in repos {
            // Discovery owns every metadata key except the revisions recorded
            // by the last successful index.
            let row = sqlx::query(
                r"
                INSERT INTO repos (
                    org_id, name, display_name, clone_url, web_url, image_url,
                    default_branch, is_fork, is_archived, is_public, size_bytes,
                    metadata, external_id, external_code_host_type, external_code_host_url
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (external_id, external_code_host_url, org_id) DO UPDATE
                SET name = EXCLUDED.name,
                    display_name = EXCLUDED.display_name,
                    clone_url = EXCLUDED.clone_url,
                    web_url = EXCLUDED.web_url,
                    image_url = EXCLUDED.image_url,
                    is_fork = EXCLUDED.is_fork,
                    is_archived = EXCLUDED.is_archived,
                    is_public = EXCLUDED.is_public,
                    size_bytes = EXCLUDED.size_bytes,
                    metadata = EXCLUDED.metadata || jsonb_strip_nulls(
                        jsonb_build_object('indexedRevisions', repos.metadata -> 'indexedRevisions')
                    ),
                    updated_at = NOW()
                RETURNING *, (xmax = 0) AS inserted
                ",
            )
            .bind(repo.org_id)
            .bind(&repo.name)
            .bind(&repo.display_name)
            .bind(&repo.clone_url)
            .bind(&repo.web_url)
            .bind(&repo.image_url)
            .bind(&repo.default_branch)
            .bind(repo.is_fork)
            .bind(repo.is_archived)
            .bind(repo.is_public)
            .bind(repo.size_bytes)
            .bind(Json(&repo.metadata))
            .bind(&repo.external_id)
            .bind(&repo.external_code_host_type)
            .bind(&repo.external_code_host_url)
            .fetch_one(&mut *tx)
            .await
            .map_db_err(operation.clone(), None)?;

            let stored = repo_from_row(&row).map_db_err(operation.clone(), None)?;
            let inserted: bool = row.try_get("inserted").map_db_err(operation.clone(), None)?;

            sqlx::query(
                r"
                INSERT INTO repo_to_connection (repo_id, connection_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(stored.id)
            .bind(connection_id)
            .execute(&mut *tx)
            .await
            .map_db_err(operation.clone(), None)?;

            linked_ids.push(stored.id);
            if inserted {
                outcome.created.push(stored);
            } else {
                outcome.updated = outcome.updated.saturating_add(1);
            }
        }

        let unlinked = sqlx::query(
            r"
            DELETE FROM repo_to_connection
            WHERE connection_id = $1
              AND NOT (repo_id = ANY($2))
            ",
        )
        .bind(connection_id)
        .bind(&linked_ids)
        .execute(&mut *tx)
        .await
        .map_db_err(operation.clone(), None)?;
        outcome.unlinked = usize::try_from(unlinked.rows_affected()).unwrap_or(usize::MAX);

        tx.commit().await.map_db_err(operation, None)?;

        Ok(outcome)
    }

    async fn connections_due_for_sync(
        &self,
        now: DateTime<Utc>,
        resync_interval: Duration,
    ) -> DatabaseResult<Vec<Connection>> {
        let pool = self.pools.read_pool();
        let operation = DatabaseOperation::ConnectionsDueForSync;

        let rows = sqlx::query(
            r"
            SELECT id, org_id, name, connection_type, config, synced_at
            FROM connections
            WHERE synced_at IS NULL OR synced_at < $1
            ORDER BY synced_at ASC NULLS FIRST, id
            ",
        )
        .bind(window_start(now, resync_interval))
        .fetch_all(pool)
        .await
        .map_db_err(operation.clone(), None)?;

        rows.iter()
            .map(connection_from_row)
            .collect::<Result<_, _>>()
            .map_db_err(operation, None)
    }

    async fn mark_connection_synced(
        &self,
        connection_id: i64,
        synced_at: DateTime<Utc>,
    ) -> DatabaseResult<()> {
        let pool = self.pools.write_pool();
        let operation = DatabaseOperation::MarkConnectionSynced { connection_id };

        sqlx::query("UPDATE connections SET synced_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(connection_id)
            .bind(synced_at)
            .execute(pool)
            .await
            .map_db_err(operation, None)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_subtracts_interval() {
        let now = DateTime::parse_from_rfc3339("2025-01-01T12:00:00Z")
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();
        let start = window_start(now, Duration::from_secs(3600));
        assert_eq!(start.to_rfc3339(), "2025-01-01T11:00:00+00:00");
    }

    #[test]
    fn test_window_start_saturates() {
        let now = Utc::now();
        assert_eq!(window_start(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
