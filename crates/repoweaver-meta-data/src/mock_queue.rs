//! In-memory implementation of [`JobQueue`] for testing

#![allow(clippy::unwrap_used)] // Mocks can panic on lock poisoning
#![allow(clippy::arithmetic_side_effects)] // Test counters can overflow
#![allow(clippy::significant_drop_tightening)] // Mock locks don't need optimization

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{DatabaseError, DatabaseOperation, DatabaseResult};
use crate::job_queue::{
    EnqueueItem, FailOutcome, JobQueue, QueueDepth, ReservedJob, STALLED_REASON, StalledJob,
    backoff_delay, new_lock_token,
};
use crate::models::{JobPayload, JobType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// A queue row as held by the mock
#[derive(Debug, Clone)]
pub struct MockQueueEntry {
    pub id: Uuid,
    pub payload: JobPayload,
    pub priority: i32,
    pub status: EntryStatus,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub stalled_count: u32,
    pub run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub visible_until: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    seq: u64,
}

impl MockQueueEntry {
    fn reserved(&self) -> ReservedJob {
        ReservedJob {
            id: self.id,
            payload: self.payload.clone(),
            priority: self.priority,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            stalled_count: self.stalled_count,
            lock_token: self.locked_by.clone().unwrap_or_default(),
        }
    }

    fn held_by(&self, job: &ReservedJob) -> bool {
        self.id == job.id
            && self.status == EntryStatus::Active
            && self.locked_by.as_deref() == Some(job.lock_token.as_str())
    }

    fn release(&mut self) {
        self.locked_by = None;
        self.visible_until = None;
    }
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Mock job queue for testing
#[derive(Clone)]
pub struct MockJobQueue {
    entries: Arc<Mutex<Vec<MockQueueEntry>>>,
    max_attempts: u32,
    next_seq: Arc<Mutex<u64>>,

    should_fail_next: Arc<Mutex<bool>>,
}

impl MockJobQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            max_attempts,
            next_seq: Arc::new(Mutex::new(0)),
            should_fail_next: Arc::new(Mutex::new(false)),
        }
    }

    /// Configure to fail on next operation
    pub fn fail_next(&self) {
        *self.should_fail_next.lock().unwrap() = true;
    }

    fn check_fail(&self) -> DatabaseResult<()> {
        let mut should_fail = self.should_fail_next.lock().unwrap();
        if *should_fail {
            *should_fail = false;
            return Err(DatabaseError::UnexpectedState {
                operation: Box::new(DatabaseOperation::Query {
                    description: "mock queue operation".to_string(),
                }),
                message: "Mock queue failure".to_string(),
                correlation_id: None,
            });
        }
        Ok(())
    }

    /// Snapshot of a single row
    pub fn entry(&self, id: Uuid) -> Option<MockQueueEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Snapshot of every row in insertion order
    pub fn entries(&self) -> Vec<MockQueueEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Make every delayed or backed-off row ready immediately
    pub fn make_ready(&self) {
        let now = Utc::now();
        for entry in self.entries.lock().unwrap().iter_mut() {
            if matches!(entry.status, EntryStatus::Waiting | EntryStatus::Delayed) {
                entry.run_at = now;
            }
        }
    }

    /// Expire every active reservation as if its worker died
    pub fn expire_reservations(&self) {
        let past = Utc::now() - TimeDelta::seconds(1);
        for entry in self.entries.lock().unwrap().iter_mut() {
            if entry.status == EntryStatus::Active {
                entry.visible_until = Some(past);
            }
        }
    }

    fn update<F>(&self, job: &ReservedJob, apply: F) -> bool
    where
        F: FnOnce(&mut MockQueueEntry),
    {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.held_by(job)) {
            Some(entry) => {
                apply(entry);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobQueue for MockJobQueue {
    async fn add_bulk(&self, items: Vec<EnqueueItem>) -> DatabaseResult<Vec<Uuid>> {
        self.check_fail()?;
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        let mut seq = self.next_seq.lock().unwrap();
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = Uuid::new_v4();
            *seq += 1;
            entries.push(MockQueueEntry {
                id,
                payload: item.payload,
                priority: item.priority,
                status: EntryStatus::Waiting,
                attempts_made: 0,
                max_attempts: self.max_attempts,
                stalled_count: 0,
                run_at: now,
                locked_by: None,
                visible_until: None,
                failed_reason: None,
                finished_at: None,
                seq: *seq,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn reserve(
        &self,
        job_type: JobType,
        worker_id: &str,
        visibility: Duration,
    ) -> DatabaseResult<Option<ReservedJob>> {
        self.check_fail()?;
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        let next = entries
            .iter_mut()
            .filter(|e| {
                e.payload.job_type == job_type
                    && matches!(e.status, EntryStatus::Waiting | EntryStatus::Delayed)
                    && e.run_at <= now
            })
            .min_by_key(|e| (std::cmp::Reverse(e.priority), e.seq));

        Ok(next.map(|entry| {
            entry.status = EntryStatus::Active;
            entry.locked_by = Some(new_lock_token(worker_id));
            entry.visible_until = Some(now + delta(visibility));
            entry.reserved()
        }))
    }

    async fn heartbeat(&self, job: &ReservedJob, visibility: Duration) -> DatabaseResult<bool> {
        self.check_fail()?;
        let deadline = Utc::now() + delta(visibility);
        Ok(self.update(job, |e| e.visible_until = Some(deadline)))
    }

    async fn complete(&self, job: &ReservedJob) -> DatabaseResult<bool> {
        self.check_fail()?;
        Ok(self.update(job, |e| {
            e.status = EntryStatus::Completed;
            e.finished_at = Some(Utc::now());
            e.release();
        }))
    }

    async fn fail(
        &self,
        job: &ReservedJob,
        reason: &str,
        backoff: Duration,
    ) -> DatabaseResult<FailOutcome> {
        self.check_fail()?;
        let mut outcome = FailOutcome::Lost;
        self.update(job, |e| {
            e.attempts_made += 1;
            e.failed_reason = Some(reason.to_string());
            e.release();
            if e.attempts_made >= e.max_attempts {
                e.status = EntryStatus::Failed;
                e.finished_at = Some(Utc::now());
                outcome = FailOutcome::Exhausted {
                    attempts: e.attempts_made,
                };
            } else {
                let delay = backoff_delay(backoff, e.attempts_made);
                e.status = EntryStatus::Delayed;
                e.run_at = Utc::now() + delta(delay);
                outcome = FailOutcome::Retrying {
                    attempt: e.attempts_made,
                    max_attempts: e.max_attempts,
                    delay,
                };
            }
        });
        Ok(outcome)
    }

    async fn fail_terminal(&self, job: &ReservedJob, reason: &str) -> DatabaseResult<bool> {
        self.check_fail()?;
        Ok(self.update(job, |e| {
            e.attempts_made += 1;
            e.status = EntryStatus::Failed;
            e.failed_reason = Some(reason.to_string());
            e.finished_at = Some(Utc::now());
            e.release();
        }))
    }

    async fn move_to_delayed(&self, job: &ReservedJob, delay: Duration) -> DatabaseResult<bool> {
        self.check_fail()?;
        let run_at = Utc::now() + delta(delay);
        Ok(self.update(job, |e| {
            e.status = EntryStatus::Delayed;
            e.run_at = run_at;
            e.release();
        }))
    }

    async fn recover_stalled(
        &self,
        job_type: JobType,
        max_stalled_count: u32,
    ) -> DatabaseResult<Vec<StalledJob>> {
        self.check_fail()?;
        let now = Utc::now();
        let mut recovered = Vec::new();
        for entry in self.entries.lock().unwrap().iter_mut() {
            let expired = entry.visible_until.is_some_and(|until| until < now);
            if entry.payload.job_type != job_type || entry.status != EntryStatus::Active || !expired
            {
                continue;
            }

            let lost_delivery = entry.reserved();
            entry.stalled_count += 1;
            entry.release();
            entry.run_at = now;
            let failed = entry.stalled_count > max_stalled_count;
            if failed {
                entry.status = EntryStatus::Failed;
                entry.failed_reason = Some(STALLED_REASON.to_string());
                entry.finished_at = Some(now);
            } else {
                entry.status = EntryStatus::Waiting;
            }
            recovered.push(StalledJob {
                job: ReservedJob {
                    stalled_count: entry.stalled_count,
                    ..lost_delivery
                },
                failed,
            });
        }
        Ok(recovered)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> DatabaseResult<u64> {
        self.check_fail()?;
        let mut entries = self.entries.lock().unwrap();
        let len = entries.len();
        entries.retain(|e| e.finished_at.is_none_or(|at| at >= before));
        Ok((len - entries.len()) as u64)
    }

    async fn depth(&self, job_type: JobType) -> DatabaseResult<QueueDepth> {
        self.check_fail()?;
        let mut depth = QueueDepth::default();
        for entry in self.entries.lock().unwrap().iter() {
            if entry.payload.job_type != job_type {
                continue;
            }
            match entry.status {
                EntryStatus::Waiting => depth.waiting += 1,
                EntryStatus::Delayed => depth.delayed += 1,
                EntryStatus::Active => depth.active += 1,
                EntryStatus::Completed => depth.completed += 1,
                EntryStatus::Failed => depth.failed += 1,
            }
        }
        Ok(depth)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn item(job_type: JobType, repo_id: i64, priority: i32) -> EnqueueItem {
        EnqueueItem {
            payload: JobPayload {
                job_id: Uuid::new_v4(),
                job_type,
                repo_id,
                repo_name: format!("github.com/org/repo-{repo_id}"),
            },
            priority,
        }
    }

    #[tokio::test]
    async fn test_reserve_orders_by_priority_then_age() {
        let queue = MockJobQueue::new(3);
        queue
            .add_bulk(vec![
                item(JobType::Index, 1, 0),
                item(JobType::Index, 2, 10),
                item(JobType::Index, 3, 10),
                item(JobType::Cleanup, 4, 100),
            ])
            .await
            .unwrap();

        let first = queue.reserve(JobType::Index, "w", VISIBILITY).await.unwrap().unwrap();
        let second = queue.reserve(JobType::Index, "w", VISIBILITY).await.unwrap().unwrap();
        let third = queue.reserve(JobType::Index, "w", VISIBILITY).await.unwrap().unwrap();

        assert_eq!(first.payload.repo_id, 2);
        assert_eq!(second.payload.repo_id, 3);
        assert_eq!(third.payload.repo_id, 1);
        assert!(queue.reserve(JobType::Index, "w", VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_backs_off_then_exhausts() {
        let queue = MockJobQueue::new(3);
        let backoff = Duration::from_millis(5000);
        queue.add_bulk(vec![item(JobType::Index, 1, 0)]).await.unwrap();

        let job = queue.reserve(JobType::Index, "w", VISIBILITY).await.unwrap().unwrap();
        let outcome = queue.fail(&job, "boom", backoff).await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 1,
                max_attempts: 3,
                delay: backoff
            }
        );
        // Backed-off rows are not ready yet
        assert!(queue.reserve(JobType::Index, "w", VISIBILITY).await.unwrap().is_none());

        queue.make_ready();
        let job = queue.reserve(JobType::Index, "w", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(job.attempt(), 2);
        let outcome = queue.fail(&job, "boom", backoff).await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { delay, .. } if delay == backoff * 2));

        queue.make_ready();
        let job = queue.reserve(JobType::Index, "w", VISIBILITY).await.unwrap().unwrap();
        let outcome = queue.fail(&job, "boom", backoff).await.unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted { attempts: 3 });
        assert_eq!(queue.entry(job.id).unwrap().status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn test_move_to_delayed_keeps_attempts() {
        let queue = MockJobQueue::new(3);
        queue.add_bulk(vec![item(JobType::Index, 1, 0)]).await.unwrap();
        let job = queue.reserve(JobType::Index, "w", VISIBILITY).await.unwrap().unwrap();

        let before = Utc::now();
        assert!(queue.move_to_delayed(&job, Duration::from_millis(5000)).await.unwrap());

        let entry = queue.entry(job.id).unwrap();
        assert_eq!(entry.status, EntryStatus::Delayed);
        assert_eq!(entry.attempts_made, 0);
        assert!(entry.run_at >= before + TimeDelta::milliseconds(5000));
    }

    #[tokio::test]
    async fn test_stalled_job_redelivered_then_failed() {
        let queue = MockJobQueue::new(3);
        queue.add_bulk(vec![item(JobType::Index, 1, 0)]).await.unwrap();

        let lost = queue.reserve(JobType::Index, "w1", VISIBILITY).await.unwrap().unwrap();
        queue.expire_reservations();
        let stalled = queue.recover_stalled(JobType::Index, 1).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert!(!stalled[0].failed);

        // The original holder can no longer complete the redelivered row
        assert!(!queue.complete(&lost).await.unwrap());

        let _again = queue.reserve(JobType::Index, "w2", VISIBILITY).await.unwrap().unwrap();
        queue.expire_reservations();
        let stalled = queue.recover_stalled(JobType::Index, 1).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert!(stalled[0].failed);

        let entry = queue.entry(lost.id).unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.failed_reason.as_deref(), Some(STALLED_REASON));
    }

    #[tokio::test]
    async fn test_depth_and_purge() {
        let queue = MockJobQueue::new(3);
        queue
            .add_bulk(vec![item(JobType::Index, 1, 0), item(JobType::Index, 2, 0)])
            .await
            .unwrap();
        let job = queue.reserve(JobType::Index, "w", VISIBILITY).await.unwrap().unwrap();
        assert!(queue.complete(&job).await.unwrap());

        let depth = queue.depth(JobType::Index).await.unwrap();
        assert_eq!(depth.waiting, 1);
        assert_eq!(depth.completed, 1);

        let purged = queue
            .purge_finished(Utc::now() + TimeDelta::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(queue.entries().len(), 1);
    }
}
