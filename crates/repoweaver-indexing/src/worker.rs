//! Queue worker for repository jobs
//!
//! A [`QueueWorker`] owns one job type. It runs `concurrency` slots that each
//! reserve a message, keep its reservation alive with a heartbeat task, run
//! the [`JobHandler`] under a job timeout, and settle the message according
//! to the returned [`JobError`]. A separate loop redelivers reservations
//! whose heartbeat stopped.
//!
//! # Cancellation
//!
//! Each job runs under a child of the shutdown token. A job cancelled by
//! shutdown is left active in the queue; stall recovery redelivers it once
//! the visibility timeout passes.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use repoweaver_common::CorrelationId;
use repoweaver_config::ApplicationConfig;
use repoweaver_meta_data::{FailOutcome, JobQueue, JobType, ReservedJob};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{IndexerError, IndexerResult};

/// Terminal reason for a job that exceeded the job timeout
pub const TIMED_OUT_REASON: &str = "Job timed out";

/// Completed and failed queue rows are kept this long for inspection
const FINISHED_ROW_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How a job attempt ended, and therefore what happens to its queue message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Consume an attempt and retry with backoff
    #[error("{0}")]
    Retryable(String),

    /// Redeliver after the delay without consuming an attempt
    #[error("Job delayed by {0:?}")]
    Delayed(Duration),

    /// Fail permanently
    #[error("{0}")]
    Fatal(String),

    /// Leave the message reserved for stall recovery
    #[error("Job cancelled")]
    Cancelled,
}

/// Job execution plus lifecycle callbacks
///
/// Callbacks are best effort: they log their own failures and never change
/// the queue outcome.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job
    ///
    /// `token` is cancelled on shutdown, on job timeout and when the
    /// reservation is lost; `shutdown` only on shutdown.
    async fn process(
        &self,
        job: &ReservedJob,
        token: CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<(), JobError>;

    async fn on_completed(&self, job: &ReservedJob);

    /// The attempt failed and the message will be redelivered
    async fn on_attempt_failed(&self, job: &ReservedJob, attempt: u32, max_attempts: u32, reason: &str);

    /// No attempts remain, or the failure was fatal
    async fn on_exhausted(&self, job: &ReservedJob, reason: &str);

    /// The reservation stalled too many times and the message was failed
    async fn on_stalled(&self, job: &ReservedJob);

    /// The job ran past the job timeout and was failed
    async fn on_graceful_timeout(&self, job: &ReservedJob);

    async fn on_error(&self, error: &IndexerError) {
        error!(error = %error, "Queue worker error");
    }
}

/// Configuration for one job type's workers
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub job_type: JobType,
    /// Number of jobs processed at once
    pub concurrency: usize,
    /// Sleep between reservation attempts on an empty queue
    pub poll_interval: Duration,
    /// Reservation lifetime without a heartbeat
    pub visibility_timeout: Duration,
    /// Base retry delay, doubled per attempt
    pub backoff: Duration,
    pub max_stalled_count: u32,
    pub stalled_check_interval: Duration,
    pub job_timeout: Duration,
    /// How long shutdown waits for running jobs before aborting them
    pub stop_grace_period: Duration,
}

impl WorkerConfig {
    /// Create worker config from application config
    pub fn from_app_config(config: &ApplicationConfig, job_type: JobType) -> Self {
        let concurrency = match job_type {
            JobType::Index => config.indexing.max_repo_indexing_job_concurrency,
            JobType::Cleanup => config.indexing.max_repo_garbage_collection_job_concurrency,
        };
        Self {
            job_type,
            concurrency,
            poll_interval: Duration::from_millis(config.queue.poll_interval_ms),
            visibility_timeout: Duration::from_millis(config.queue.visibility_timeout_ms),
            backoff: Duration::from_millis(config.queue.backoff_ms),
            max_stalled_count: config.queue.max_stalled_count,
            stalled_check_interval: Duration::from_millis(config.queue.stalled_check_interval_ms),
            job_timeout: Duration::from_millis(config.indexing.repo_index_timeout_ms),
            stop_grace_period: Duration::from_millis(config.queue.worker_stop_grace_period_ms),
        }
    }
}

/// Worker pool for one job type
#[derive(Clone)]
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    worker_id: String,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        let worker_id = format!("{}-{}", config.job_type.label(), Uuid::new_v4());
        Self {
            queue,
            handler,
            config,
            worker_id,
        }
    }

    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run every slot and the stall recovery loop until `shutdown` is cancelled
    ///
    /// After cancellation, running jobs get `stop_grace_period` to wind down
    /// before their tasks are aborted.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            job_type = %self.config.job_type,
            concurrency = self.config.concurrency,
            worker_id = %self.worker_id,
            "🚀 Queue worker started"
        );

        let mut join_set = JoinSet::new();
        for slot in 0..self.config.concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            join_set.spawn(async move { worker.slot_loop(slot, shutdown).await });
        }
        {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            join_set.spawn(async move { worker.stall_loop(shutdown).await });
        }

        shutdown.cancelled().await;
        info!(
            job_type = %self.config.job_type,
            tasks = join_set.len(),
            "Shutdown signal received, waiting for workers to finish"
        );

        let drain = async {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked");
                }
            }
        };
        if tokio::time::timeout(self.config.stop_grace_period, drain).await.is_err() {
            warn!(
                job_type = %self.config.job_type,
                grace_period_ms = self.config.stop_grace_period.as_millis(),
                "Workers did not stop within the grace period, aborting"
            );
            join_set.abort_all();
        }

        info!(job_type = %self.config.job_type, "🛑 Queue worker stopped");
    }

    /// Reserve and run a single job (for testing)
    ///
    /// Returns the queue message id, or `None` if nothing was ready.
    pub async fn process_one_job(&self, shutdown: &CancellationToken) -> IndexerResult<Option<Uuid>> {
        let reserved = self
            .queue
            .reserve(self.config.job_type, &self.worker_id, self.config.visibility_timeout)
            .await?;
        match reserved {
            Some(job) => {
                let id = job.id;
                self.execute(job, shutdown).await;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// One stall recovery pass; returns how many reservations were recovered
    pub async fn recover_stalled(&self) -> IndexerResult<usize> {
        let stalled = self
            .queue
            .recover_stalled(self.config.job_type, self.config.max_stalled_count)
            .await?;

        for entry in &stalled {
            if entry.failed {
                error!(
                    job_id = %entry.job.payload.job_id,
                    repo_id = entry.job.payload.repo_id,
                    stalled_count = entry.job.stalled_count,
                    "Job stalled too many times, failing"
                );
                self.handler.on_stalled(&entry.job).await;
            } else {
                warn!(
                    job_id = %entry.job.payload.job_id,
                    repo_id = entry.job.payload.repo_id,
                    "Job stalled, redelivering"
                );
            }
        }
        Ok(stalled.len())
    }

    async fn slot_loop(&self, slot: usize, shutdown: CancellationToken) {
        tracing::debug!(job_type = %self.config.job_type, slot, "Worker slot starting");

        while !shutdown.is_cancelled() {
            let idle = match self.process_one_job(&shutdown).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    self.handler.on_error(&e).await;
                    true
                }
            };

            if idle {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        tracing::debug!(job_type = %self.config.job_type, slot, "Worker slot stopped");
    }

    async fn stall_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.stalled_check_interval) => {}
            }

            if let Err(e) = self.recover_stalled().await {
                self.handler.on_error(&e).await;
            }

            let cutoff = TimeDelta::from_std(FINISHED_ROW_RETENTION)
                .ok()
                .and_then(|retention| Utc::now().checked_sub_signed(retention));
            if let Some(cutoff) = cutoff {
                match self.queue.purge_finished(cutoff).await {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "Purged finished queue rows"),
                    Err(e) => self.handler.on_error(&IndexerError::from(e)).await,
                }
            }
        }
    }

    /// Run one reserved job to a settled queue state
    #[tracing::instrument(
        skip(self, job, shutdown),
        fields(
            job_id = %job.payload.job_id,
            repo_id = job.payload.repo_id,
            job_type = %job.payload.job_type,
            attempt = job.attempt(),
            correlation_id = %CorrelationId::new(),
        )
    )]
    async fn execute(&self, job: ReservedJob, shutdown: &CancellationToken) {
        let job_token = shutdown.child_token();
        let stop_heartbeat = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.queue),
            job.clone(),
            self.config.visibility_timeout,
            job_token.clone(),
            stop_heartbeat.clone(),
        ));

        let outcome = {
            let process = self.handler.process(&job, job_token.clone(), shutdown);
            tokio::pin!(process);
            tokio::select! {
                result = &mut process => Some(result),
                () = tokio::time::sleep(self.config.job_timeout) => {
                    job_token.cancel();
                    // Let the handler observe cancellation and unwind its lock
                    if tokio::time::timeout(self.config.stop_grace_period, &mut process).await.is_err() {
                        warn!("Timed out job did not unwind within the grace period");
                    }
                    None
                }
            }
        };

        stop_heartbeat.cancel();
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }

        if let Err(e) = self.settle(&job, outcome, shutdown).await {
            self.handler.on_error(&e).await;
        }
    }

    async fn settle(
        &self,
        job: &ReservedJob,
        outcome: Option<Result<(), JobError>>,
        shutdown: &CancellationToken,
    ) -> IndexerResult<()> {
        let Some(result) = outcome else {
            error!(
                timeout_ms = self.config.job_timeout.as_millis(),
                "Job exceeded the job timeout"
            );
            if self.queue.fail_terminal(job, TIMED_OUT_REASON).await? {
                self.handler.on_graceful_timeout(job).await;
            }
            return Ok(());
        };

        match result {
            Ok(()) => {
                if self.queue.complete(job).await? {
                    self.handler.on_completed(job).await;
                } else {
                    warn!("Reservation lost before completion");
                }
            }
            Err(JobError::Cancelled) => {
                info!(
                    shutdown = shutdown.is_cancelled(),
                    "Job cancelled, leaving it for stall recovery"
                );
            }
            Err(JobError::Delayed(delay)) => {
                if self.queue.move_to_delayed(job, delay).await? {
                    info!(delay_ms = delay.as_millis(), "Job delayed");
                }
            }
            Err(JobError::Fatal(reason)) => {
                error!(reason = %reason, "Job failed with a fatal error");
                if self.queue.fail_terminal(job, &reason).await? {
                    self.handler.on_exhausted(job, &reason).await;
                }
                self.handler
                    .on_error(&IndexerError::invalid_state(reason))
                    .await;
            }
            Err(JobError::Retryable(reason)) => {
                match self.queue.fail(job, &reason, self.config.backoff).await? {
                    FailOutcome::Retrying {
                        attempt,
                        max_attempts,
                        ..
                    } => {
                        self.handler
                            .on_attempt_failed(job, attempt, max_attempts, &reason)
                            .await;
                    }
                    FailOutcome::Exhausted { .. } => {
                        self.handler.on_exhausted(job, &reason).await;
                    }
                    FailOutcome::Lost => warn!("Reservation lost before the failure was recorded"),
                }
            }
        }
        Ok(())
    }
}

/// Keep the reservation visible; cancels `job_token` if it is taken away
async fn heartbeat_loop(
    queue: Arc<dyn JobQueue>,
    job: ReservedJob,
    visibility: Duration,
    job_token: CancellationToken,
    stop: CancellationToken,
) {
    let interval = (visibility / 3).max(Duration::from_millis(10));
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }

        match queue.heartbeat(&job, visibility).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.payload.job_id, "Reservation lost, cancelling job");
                job_token.cancel();
                return;
            }
            Err(e) => warn!(job_id = %job.payload.job_id, error = %e, "Heartbeat failed"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use repoweaver_meta_data::mock_queue::EntryStatus;
    use repoweaver_meta_data::{EnqueueItem, JobPayload, MockJobQueue};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedHandler {
        results: Mutex<Vec<Result<(), JobError>>>,
        hang: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn with_results(results: Vec<Result<(), JobError>>) -> Self {
            Self {
                results: Mutex::new(results),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn process(
            &self,
            _job: &ReservedJob,
            token: CancellationToken,
            _shutdown: &CancellationToken,
        ) -> Result<(), JobError> {
            if self.hang {
                token.cancelled().await;
                return Err(JobError::Cancelled);
            }
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }

        async fn on_completed(&self, _job: &ReservedJob) {
            self.push("completed".to_string());
        }

        async fn on_attempt_failed(&self, _job: &ReservedJob, attempt: u32, max_attempts: u32, _reason: &str) {
            self.push(format!("attempt_failed {attempt}/{max_attempts}"));
        }

        async fn on_exhausted(&self, _job: &ReservedJob, reason: &str) {
            self.push(format!("exhausted {reason}"));
        }

        async fn on_stalled(&self, _job: &ReservedJob) {
            self.push("stalled".to_string());
        }

        async fn on_graceful_timeout(&self, _job: &ReservedJob) {
            self.push("timeout".to_string());
        }

        async fn on_error(&self, error: &IndexerError) {
            self.push(format!("error {error}"));
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            job_type: JobType::Index,
            concurrency: 1,
            poll_interval: Duration::from_millis(10),
            visibility_timeout: Duration::from_secs(30),
            backoff: Duration::from_secs(5),
            max_stalled_count: 1,
            stalled_check_interval: Duration::from_secs(30),
            job_timeout: Duration::from_secs(60),
            stop_grace_period: Duration::from_secs(1),
        }
    }

    async fn enqueue(queue: &MockJobQueue) -> Uuid {
        let ids = queue
            .add_bulk(vec![EnqueueItem {
                payload: JobPayload {
                    job_id: Uuid::new_v4(),
                    job_type: JobType::Index,
                    repo_id: 1,
                    repo_name: "github.com/org/repo".to_string(),
                },
                priority: 0,
            }])
            .await
            .unwrap();
        ids[0]
    }

    fn worker(queue: &MockJobQueue, handler: &Arc<ScriptedHandler>, config: WorkerConfig) -> QueueWorker {
        QueueWorker::new(
            Arc::new(queue.clone()),
            Arc::clone(handler) as Arc<dyn JobHandler>,
            config,
        )
    }

    #[tokio::test]
    async fn test_success_completes_message() {
        let queue = MockJobQueue::new(3);
        let id = enqueue(&queue).await;
        let handler = Arc::new(ScriptedHandler::default());
        let worker = worker(&queue, &handler, config());

        let processed = worker.process_one_job(&CancellationToken::new()).await.unwrap();

        assert_eq!(processed, Some(id));
        assert_eq!(queue.entry(id).unwrap().status, EntryStatus::Completed);
        assert_eq!(handler.calls(), vec!["completed".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let queue = MockJobQueue::new(3);
        let handler = Arc::new(ScriptedHandler::default());
        let worker = worker(&queue, &handler, config());

        assert_eq!(worker.process_one_job(&CancellationToken::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_retryable_errors_back_off_then_exhaust() {
        let queue = MockJobQueue::new(2);
        let id = enqueue(&queue).await;
        let handler = Arc::new(ScriptedHandler::with_results(vec![
            Err(JobError::Retryable("clone failed".to_string())),
            Err(JobError::Retryable("clone failed".to_string())),
        ]));
        let worker = worker(&queue, &handler, config());
        let shutdown = CancellationToken::new();

        worker.process_one_job(&shutdown).await.unwrap();
        let entry = queue.entry(id).unwrap();
        assert_eq!(entry.attempts_made, 1);
        assert!(entry.run_at > Utc::now() + TimeDelta::seconds(4));

        // Still backing off
        assert_eq!(worker.process_one_job(&shutdown).await.unwrap(), None);

        queue.make_ready();
        worker.process_one_job(&shutdown).await.unwrap();
        assert_eq!(queue.entry(id).unwrap().status, EntryStatus::Failed);
        assert_eq!(
            handler.calls(),
            vec![
                "attempt_failed 1/2".to_string(),
                "exhausted clone failed".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_delayed_keeps_attempts() {
        let queue = MockJobQueue::new(3);
        let id = enqueue(&queue).await;
        let handler = Arc::new(ScriptedHandler::with_results(vec![Err(JobError::Delayed(
            Duration::from_millis(5000),
        ))]));
        let worker = worker(&queue, &handler, config());

        worker.process_one_job(&CancellationToken::new()).await.unwrap();

        let entry = queue.entry(id).unwrap();
        assert_eq!(entry.status, EntryStatus::Delayed);
        assert_eq!(entry.attempts_made, 0);
        assert!(handler.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_fails_without_retry() {
        let queue = MockJobQueue::new(3);
        let id = enqueue(&queue).await;
        let handler = Arc::new(ScriptedHandler::with_results(vec![Err(JobError::Fatal(
            "job is COMPLETED".to_string(),
        ))]));
        let worker = worker(&queue, &handler, config());

        worker.process_one_job(&CancellationToken::new()).await.unwrap();

        assert_eq!(queue.entry(id).unwrap().status, EntryStatus::Failed);
        let calls = handler.calls();
        assert_eq!(calls[0], "exhausted job is COMPLETED");
        assert!(calls[1].starts_with("error Invalid state"));
    }

    #[tokio::test]
    async fn test_cancelled_job_is_left_for_stall_recovery() {
        let queue = MockJobQueue::new(3);
        let id = enqueue(&queue).await;
        let handler = Arc::new(ScriptedHandler::with_results(vec![
            Err(JobError::Cancelled),
            Err(JobError::Cancelled),
        ]));
        let worker = worker(&queue, &handler, config());

        worker.process_one_job(&CancellationToken::new()).await.unwrap();
        assert_eq!(queue.entry(id).unwrap().status, EntryStatus::Active);

        queue.expire_reservations();
        assert_eq!(worker.recover_stalled().await.unwrap(), 1);
        assert_eq!(queue.entry(id).unwrap().status, EntryStatus::Waiting);

        // Second stall exceeds max_stalled_count of 1
        let handler_calls_before = handler.calls().len();
        worker.process_one_job(&CancellationToken::new()).await.unwrap();
        queue.expire_reservations();
        worker.recover_stalled().await.unwrap();
        assert_eq!(queue.entry(id).unwrap().status, EntryStatus::Failed);
        assert_eq!(handler.calls()[handler_calls_before..], ["stalled".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_fails_terminally() {
        let queue = MockJobQueue::new(3);
        let id = enqueue(&queue).await;
        let handler = Arc::new(ScriptedHandler {
            hang: true,
            ..ScriptedHandler::default()
        });
        let mut config = config();
        config.job_timeout = Duration::from_secs(5);
        let worker = worker(&queue, &handler, config);

        worker.process_one_job(&CancellationToken::new()).await.unwrap();

        let entry = queue.entry(id).unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.failed_reason.as_deref(), Some(TIMED_OUT_REASON));
        assert_eq!(handler.calls(), vec!["timeout".to_string()]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = MockJobQueue::new(3);
        let id = enqueue(&queue).await;
        let handler = Arc::new(ScriptedHandler::default());
        let worker = worker(&queue, &handler, config());
        let shutdown = CancellationToken::new();

        let running = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        for _ in 0..100 {
            if queue.entry(id).unwrap().status == EntryStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        running.await.unwrap();

        assert_eq!(queue.entry(id).unwrap().status, EntryStatus::Completed);
    }
}
