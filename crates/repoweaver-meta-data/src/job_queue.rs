//! PostgreSQL-backed durable job queue
//!
//! Workers claim rows with `FOR UPDATE SKIP LOCKED`, keep them alive with a
//! heartbeat, and hand them back as completed, failed, delayed or (when the
//! worker disappears) stalled. Every transition after `reserve` is guarded by
//! the lock token handed out at reservation, so a worker that lost its row to
//! stall recovery cannot complete or fail the redelivered copy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{DatabaseError, DatabaseErrorExt, DatabaseOperation, DatabaseResult};
use crate::models::{JobPayload, JobType};

/// Reason recorded when a job exceeds its stall limit
pub const STALLED_REASON: &str = "Job stalled";

/// A message to enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueItem {
    pub payload: JobPayload,
    /// Higher priorities are reserved first
    pub priority: i32,
}

/// A message held by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedJob {
    pub id: Uuid,
    pub payload: JobPayload,
    pub priority: i32,
    /// Failed attempts before this delivery
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub stalled_count: u32,
    /// Identifies this delivery; required for every later transition
    pub lock_token: String,
}

impl ReservedJob {
    /// 1-based number of this delivery attempt
    pub const fn attempt(&self) -> u32 {
        self.attempts_made.saturating_add(1)
    }
}

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Will be redelivered after the backoff delay
    Retrying {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// Out of attempts; the row is now failed
    Exhausted { attempts: u32 },
    /// The row is no longer held under this lock token
    Lost,
}

/// A reservation whose heartbeat stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub job: ReservedJob,
    /// True when the stall limit is used up and the row was failed
    pub failed: bool,
}

/// Queue depth statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Durable queue operations used by the scheduler and the workers
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue messages, each with its own priority
    async fn add_bulk(&self, items: Vec<EnqueueItem>) -> DatabaseResult<Vec<Uuid>>;

    /// Claim the next ready message of `job_type`
    ///
    /// Ready means waiting or delayed with `run_at` in the past. Ordered by
    /// priority (highest first), then age.
    async fn reserve(
        &self,
        job_type: JobType,
        worker_id: &str,
        visibility: Duration,
    ) -> DatabaseResult<Option<ReservedJob>>;

    /// Push the visibility deadline forward; false if the reservation was lost
    async fn heartbeat(&self, job: &ReservedJob, visibility: Duration) -> DatabaseResult<bool>;

    /// Mark the message completed; false if the reservation was lost
    async fn complete(&self, job: &ReservedJob) -> DatabaseResult<bool>;

    /// Record a failed attempt, scheduling a retry with exponential backoff
    /// (`backoff * 2^(attempt - 1)`) until `max_attempts` is reached
    async fn fail(
        &self,
        job: &ReservedJob,
        reason: &str,
        backoff: Duration,
    ) -> DatabaseResult<FailOutcome>;

    /// Fail the message permanently regardless of remaining attempts
    async fn fail_terminal(&self, job: &ReservedJob, reason: &str) -> DatabaseResult<bool>;

    /// Release the message for redelivery after `delay` without consuming an attempt
    async fn move_to_delayed(&self, job: &ReservedJob, delay: Duration) -> DatabaseResult<bool>;

    /// Redeliver or fail reservations whose visibility deadline has passed
    async fn recover_stalled(
        &self,
        job_type: JobType,
        max_stalled_count: u32,
    ) -> DatabaseResult<Vec<StalledJob>>;

    /// Delete completed and failed rows that finished before `before`
    async fn purge_finished(&self, before: DateTime<Utc>) -> DatabaseResult<u64>;

    async fn depth(&self, job_type: JobType) -> DatabaseResult<QueueDepth>;
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn new_lock_token(worker_id: &str) -> String {
    format!("{worker_id}:{}", Uuid::new_v4())
}

/// Exponential backoff for the given 1-based attempt
pub fn backoff_delay(backoff: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30);
    backoff.saturating_mul(1_u32 << exponent)
}

fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn reserved_from_row(row: &PgRow) -> Result<ReservedJob, sqlx::Error> {
    let payload: serde_json::Value = row.try_get("payload")?;
    let payload: JobPayload =
        serde_json::from_value(payload).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(ReservedJob {
        id: row.try_get("id")?,
        payload,
        priority: row.try_get("priority")?,
        attempts_made: non_negative(row.try_get("attempts_made")?),
        max_attempts: non_negative(row.try_get("max_attempts")?),
        stalled_count: non_negative(row.try_get("stalled_count")?),
        lock_token: row
            .try_get::<Option<String>, _>("locked_by")?
            .unwrap_or_default(),
    })
}

/// `PostgreSQL` implementation of the job queue
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    max_attempts: u32,
}

impl PostgresJobQueue {
    pub const fn new(pool: PgPool, max_attempts: u32) -> Self {
        Self { pool, max_attempts }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn add_bulk(&self, items: Vec<EnqueueItem>) -> DatabaseResult<Vec<Uuid>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let operation = DatabaseOperation::QueueAdd { count: items.len() };

        let ids: Vec<Uuid> = items.iter().map(|_| Uuid::new_v4()).collect();
        let job_types: Vec<&str> = items.iter().map(|i| i.payload.job_type.as_str()).collect();
        let priorities: Vec<i32> = items.iter().map(|i| i.priority).collect();
        let payloads = items
            .iter()
            .map(|i| serde_json::to_value(&i.payload))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DatabaseError::UnexpectedState {
                operation: Box::new(operation.clone()),
                message: format!("Failed to serialize payload: {e}"),
                correlation_id: None,
            })?;

        sqlx::query(
            r"
            INSERT INTO repo_job_queue (id, job_type, payload, priority, max_attempts, status, run_at)
            SELECT t.id, t.job_type, t.payload, t.priority, $5, 'waiting', NOW()
            FROM UNNEST($1::uuid[], $2::text[], $3::jsonb[], $4::int[])
                AS t(id, job_type, payload, priority)
            ",
        )
        .bind(&ids)
        .bind(&job_types)
        .bind(&payloads)
        .bind(&priorities)
        .bind(i32::try_from(self.max_attempts).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_db_err(operation, None)?;

        Ok(ids)
    }

    async fn reserve(
        &self,
        job_type: JobType,
        worker_id: &str,
        visibility: Duration,
    ) -> DatabaseResult<Option<ReservedJob>> {
        let operation = DatabaseOperation::QueueReserve {
            job_type: job_type.to_string(),
        };

        let row = sqlx::query(
            r"
            WITH next AS (
                SELECT id
                FROM repo_job_queue
                WHERE job_type = $1
                  AND status IN ('waiting', 'delayed')
                  AND run_at <= NOW()
                ORDER BY priority DESC, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE repo_job_queue q
            SET status = 'active',
                locked_by = $2,
                visible_until = NOW() + $3 * INTERVAL '1 millisecond'
            FROM next
            WHERE q.id = next.id
            RETURNING q.*
            ",
        )
        .bind(job_type.as_str())
        .bind(new_lock_token(worker_id))
        .bind(millis(visibility))
        .fetch_optional(&self.pool)
        .await
        .map_db_err(operation.clone(), None)?;

        row.as_ref()
            .map(reserved_from_row)
            .transpose()
            .map_db_err(operation, None)
    }

    async fn heartbeat(&self, job: &ReservedJob, visibility: Duration) -> DatabaseResult<bool> {
        let operation = DatabaseOperation::QueueUpdate {
            queue_id: job.id,
            action: "heartbeat",
        };

        let result = sqlx::query(
            r"
            UPDATE repo_job_queue
            SET visible_until = NOW() + $3 * INTERVAL '1 millisecond'
            WHERE id = $1 AND locked_by = $2 AND status = 'active'
            ",
        )
        .bind(job.id)
        .bind(&job.lock_token)
        .bind(millis(visibility))
        .execute(&self.pool)
        .await
        .map_db_err(operation, None)?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, job: &ReservedJob) -> DatabaseResult<bool> {
        let operation = DatabaseOperation::QueueUpdate {
            queue_id: job.id,
            action: "complete",
        };

        let result = sqlx::query(
            r"
            UPDATE repo_job_queue
            SET status = 'completed',
                finished_at = NOW(),
                locked_by = NULL,
                visible_until = NULL
            WHERE id = $1 AND locked_by = $2 AND status = 'active'
            ",
        )
        .bind(job.id)
        .bind(&job.lock_token)
        .execute(&self.pool)
        .await
        .map_db_err(operation, None)?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail(
        &self,
        job: &ReservedJob,
        reason: &str,
        backoff: Duration,
    ) -> DatabaseResult<FailOutcome> {
        let operation = DatabaseOperation::QueueUpdate {
            queue_id: job.id,
            action: "fail",
        };

        // SET expressions read the pre-update attempts_made, so the retry
        // delay is backoff * 2^(attempt - 1).
        let row = sqlx::query(
            r"
            UPDATE repo_job_queue
            SET attempts_made = attempts_made + 1,
                status = CASE
                    WHEN attempts_made + 1 >= max_attempts THEN 'failed'
                    ELSE 'delayed'
                END,
                run_at = CASE
                    WHEN attempts_made + 1 >= max_attempts THEN run_at
                    ELSE NOW() + ($3 * POWER(2, LEAST(attempts_made, 30))) * INTERVAL '1 millisecond'
                END,
                finished_at = CASE
                    WHEN attempts_made + 1 >= max_attempts THEN NOW()
                    ELSE NULL
                END,
                failed_reason = $4,
                locked_by = NULL,
                visible_until = NULL
            WHERE id = $1 AND locked_by = $2 AND status = 'active'
            RETURNING attempts_made, max_attempts, status
            ",
        )
        .bind(job.id)
        .bind(&job.lock_token)
        .bind(millis(backoff))
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_db_err(operation.clone(), None)?;

        let Some(row) = row else {
            return Ok(FailOutcome::Lost);
        };

        let attempts = non_negative(row.try_get("attempts_made").map_db_err(operation.clone(), None)?);
        let max_attempts = non_negative(row.try_get("max_attempts").map_db_err(operation.clone(), None)?);
        let status: String = row.try_get("status").map_db_err(operation, None)?;

        if status == "failed" {
            Ok(FailOutcome::Exhausted { attempts })
        } else {
            Ok(FailOutcome::Retrying {
                attempt: attempts,
                max_attempts,
                delay: backoff_delay(backoff, attempts),
            })
        }
    }

    async fn fail_terminal(&self, job: &ReservedJob, reason: &str) -> DatabaseResult<bool> {
        let operation = DatabaseOperation::QueueUpdate {
            queue_id: job.id,
            action: "fail_terminal",
        };

        let result = sqlx::query(
            r"
            UPDATE repo_job_queue
            SET status = 'failed',
                attempts_made = attempts_made + 1,
                failed_reason = $3,
                finished_at = NOW(),
                locked_by = NULL,
                visible_until = NULL
            WHERE id = $1 AND locked_by = $2 AND status = 'active'
            ",
        )
        .bind(job.id)
        .bind(&job.lock_token)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_db_err(operation, None)?;

        Ok(result.rows_affected() > 0)
    }

    async fn move_to_delayed(&self, job: &ReservedJob, delay: Duration) -> DatabaseResult<bool> {
        let operation = DatabaseOperation::QueueUpdate {
            queue_id: job.id,
            action: "move_to_delayed",
        };

        let result = sqlx::query(
            r"
            UPDATE repo_job_queue
            SET status = 'delayed',
                run_at = NOW() + $3 * INTERVAL '1 millisecond',
                locked_by = NULL,
                visible_until = NULL
            WHERE id = $1 AND locked_by = $2 AND status = 'active'
            ",
        )
        .bind(job.id)
        .bind(&job.lock_token)
        .bind(millis(delay))
        .execute(&self.pool)
        .await
        .map_db_err(operation, None)?;

        Ok(result.rows_affected() > 0)
    }

    async fn recover_stalled(
        &self,
        job_type: JobType,
        max_stalled_count: u32,
    ) -> DatabaseResult<Vec<StalledJob>> {
        let operation = DatabaseOperation::QueueRecoverStalled;
        let max_stalled = i32::try_from(max_stalled_count).unwrap_or(i32::MAX);

        // RETURNING sees the updated row; the old lock token is captured in
        // the CTE so the handler can still identify the lost delivery.
        let rows = sqlx::query(
            r"
            WITH stalled AS (
                SELECT id, locked_by
                FROM repo_job_queue
                WHERE job_type = $1
                  AND status = 'active'
                  AND visible_until < NOW()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE repo_job_queue q
            SET stalled_count = q.stalled_count + 1,
                status = CASE WHEN q.stalled_count + 1 > $2 THEN 'failed' ELSE 'waiting' END,
                failed_reason = CASE WHEN q.stalled_count + 1 > $2 THEN $3 ELSE q.failed_reason END,
                finished_at = CASE WHEN q.stalled_count + 1 > $2 THEN NOW() ELSE NULL END,
                run_at = NOW(),
                locked_by = NULL,
                visible_until = NULL
            FROM stalled
            WHERE q.id = stalled.id
            RETURNING q.id, q.payload, q.priority, q.attempts_made, q.max_attempts,
                      q.stalled_count, stalled.locked_by, q.status
            ",
        )
        .bind(job_type.as_str())
        .bind(max_stalled)
        .bind(STALLED_REASON)
        .fetch_all(&self.pool)
        .await
        .map_db_err(operation.clone(), None)?;

        rows.iter()
            .map(|row| {
                let job = reserved_from_row(row)?;
                let status: String = row.try_get("status")?;
                Ok(StalledJob {
                    job,
                    failed: status == "failed",
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_db_err(operation, None)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> DatabaseResult<u64> {
        let operation = DatabaseOperation::Query {
            description: "purge_finished_queue_rows".to_string(),
        };

        let result = sqlx::query(
            r"
            DELETE FROM repo_job_queue
            WHERE status IN ('completed', 'failed')
              AND finished_at < $1
            ",
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .map_db_err(operation, None)?;

        Ok(result.rows_affected())
    }

    async fn depth(&self, job_type: JobType) -> DatabaseResult<QueueDepth> {
        let operation = DatabaseOperation::Query {
            description: "queue_depth".to_string(),
        };

        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) FILTER (WHERE status = 'waiting') AS waiting,
                COUNT(*) FILTER (WHERE status = 'delayed') AS delayed,
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM repo_job_queue
            WHERE job_type = $1
            ",
        )
        .bind(job_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_db_err(operation, None)?;

        Ok(QueueDepth {
            waiting: row.try_get("waiting").unwrap_or(0),
            delayed: row.try_get("delayed").unwrap_or(0),
            active: row.try_get("active").unwrap_or(0),
            completed: row.try_get("completed").unwrap_or(0),
            failed: row.try_get("failed").unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_millis(5000);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(5000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(20_000));
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff_delay(Duration::MAX, 40), Duration::MAX);
    }

    #[test]
    fn test_lock_tokens_are_unique_per_delivery() {
        let a = new_lock_token("worker-1");
        let b = new_lock_token("worker-1");
        assert!(a.starts_with("worker-1:"));
        assert_ne!(a, b);
    }
}
