//! Durable queue transitions against a live `PostgreSQL`

#![allow(clippy::unwrap_used)] // Tests can use unwrap for assertions
#![allow(clippy::indexing_slicing)] // Tests can use direct indexing

#[path = "test_utils.rs"]
mod test_utils;

use repoweaver_meta_data::{
    EnqueueItem, FailOutcome, JobPayload, JobQueue, JobType, PostgresJobQueue, ReservedJob,
};
use sqlx::{PgPool, Row};
use std::time::Duration;
use test_utils::{get_test_runtime, test_pools, unique_name};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Prefix on every payload this binary enqueues
const TEST_REPO_PREFIX: &str = "queue-test/";
const WORKER: &str = "queue-test-worker";
const VISIBILITY: Duration = Duration::from_secs(30);
const BACKOFF: Duration = Duration::from_millis(20);

/// Tests in this binary share one queue table; reserve order is global
static QUEUE: Mutex<()> = Mutex::const_new(());

/// Drop what earlier runs of this binary left behind
async fn clear_test_rows(pool: &PgPool) {
    sqlx::query("DELETE FROM repo_job_queue WHERE payload->>'repoName' LIKE $1")
        .bind(format!("{TEST_REPO_PREFIX}%"))
        .execute(pool)
        .await
        .unwrap();
}

async fn enqueue_one(queue: &PostgresJobQueue) -> Uuid {
    let ids = queue
        .add_bulk(vec![EnqueueItem {
            payload: JobPayload {
                job_id: Uuid::new_v4(),
                job_type: JobType::Index,
                repo_id: 1,
                repo_name: format!("{TEST_REPO_PREFIX}{}", unique_name("repo")),
            },
            priority: i32::MAX,
        }])
        .await
        .unwrap();
    ids[0]
}

async fn reserve(queue: &PostgresJobQueue) -> Option<ReservedJob> {
    queue
        .reserve(JobType::Index, WORKER, VISIBILITY)
        .await
        .unwrap()
}

struct QueueRow {
    status: String,
    attempts_made: i32,
    run_at_in_future: bool,
    failed_reason: Option<String>,
}

async fn queue_row(pool: &PgPool, id: Uuid) -> QueueRow {
    let row = sqlx::query(
        "SELECT status, attempts_made, run_at > NOW() AS pending, failed_reason FROM repo_job_queue WHERE id = $1",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .unwrap();
    QueueRow {
        status: row.get("status"),
        attempts_made: row.get("attempts_made"),
        run_at_in_future: row.get("pending"),
        failed_reason: row.get("failed_reason"),
    }
}

#[test]
fn test_failed_attempt_retries_then_exhausts() {
    get_test_runtime().block_on(async {
        let Some(pools) = test_pools().await else {
            return;
        };
        let _queue_guard = QUEUE.lock().await;
        let pool = pools.write_pool().clone();
        clear_test_rows(&pool).await;
        let queue = PostgresJobQueue::new(pool.clone(), 2);
        let id = enqueue_one(&queue).await;

        let first = reserve(&queue).await.unwrap();
        assert_eq!(first.id, id);
        assert_eq!(first.attempt(), 1);
        assert_eq!(first.max_attempts, 2);

        let outcome = queue.fail(&first, "clone failed", BACKOFF).await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 1,
                max_attempts: 2,
                delay: BACKOFF,
            }
        );
        let row = queue_row(&pool, id).await;
        assert_eq!(row.status, "delayed");
        assert_eq!(row.attempts_made, 1);
        assert_eq!(row.failed_reason.as_deref(), Some("clone failed"));

        // The stale delivery can no longer settle the row
        assert!(!queue.complete(&first).await.unwrap());
        assert_eq!(queue.fail(&first, "again", BACKOFF).await.unwrap(), FailOutcome::Lost);

        tokio::time::sleep(BACKOFF * 5).await;
        let second = reserve(&queue).await.unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.attempt(), 2);
        assert_ne!(second.lock_token, first.lock_token);

        let outcome = queue.fail(&second, "index failed", BACKOFF).await.unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted { attempts: 2 });
        let row = queue_row(&pool, id).await;
        assert_eq!(row.status, "failed");
        assert_eq!(row.failed_reason.as_deref(), Some("index failed"));

        tokio::time::sleep(BACKOFF * 5).await;
        assert!(reserve(&queue).await.is_none_or(|job| job.id != id));
        clear_test_rows(&pool).await;
    });
}

#[test]
fn test_delayed_job_keeps_its_attempts() {
    get_test_runtime().block_on(async {
        let Some(pools) = test_pools().await else {
            return;
        };
        let _queue_guard = QUEUE.lock().await;
        let pool = pools.write_pool().clone();
        clear_test_rows(&pool).await;
        let queue = PostgresJobQueue::new(pool.clone(), 3);
        let id = enqueue_one(&queue).await;

        let job = reserve(&queue).await.unwrap();
        assert_eq!(job.id, id);
        assert!(queue.move_to_delayed(&job, Duration::from_secs(60)).await.unwrap());

        let row = queue_row(&pool, id).await;
        assert_eq!(row.status, "delayed");
        assert_eq!(row.attempts_made, 0);
        assert!(row.run_at_in_future);
        assert!(reserve(&queue).await.is_none_or(|other| other.id != id));

        // The released delivery can no longer move the row
        assert!(!queue.move_to_delayed(&job, Duration::ZERO).await.unwrap());
        clear_test_rows(&pool).await;

        let id = enqueue_one(&queue).await;
        let job = reserve(&queue).await.unwrap();
        assert!(queue.move_to_delayed(&job, BACKOFF).await.unwrap());
        tokio::time::sleep(BACKOFF * 5).await;

        let again = reserve(&queue).await.unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts_made, 0);
        assert!(queue.complete(&again).await.unwrap());
        assert_eq!(queue_row(&pool, id).await.status, "completed");
        clear_test_rows(&pool).await;
    });
}
