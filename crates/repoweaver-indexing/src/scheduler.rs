//! Periodic selection of repositories that need indexing or cleanup

use chrono::{DateTime, Utc};
use repoweaver_config::ApplicationConfig;
use repoweaver_meta_data::{EnqueueItem, JobPayload, JobQueue, JobType, Repo, RepoStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::IndexerResult;
use crate::telemetry::JobMetrics;

/// Queue priority for orgs below the large-org threshold
pub const DEFAULT_PRIORITY: i32 = 0;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub polling_interval: Duration,
    pub reindex_interval: Duration,
    pub gc_grace_period: Duration,
    /// Active jobs older than this no longer block rescheduling
    pub job_timeout: Duration,
    /// Orgs with more due repositories than this are scheduled at lower priority
    pub large_org_repo_threshold: usize,
}

impl SchedulerSettings {
    pub fn from_app_config(config: &ApplicationConfig) -> Self {
        let indexing = &config.indexing;
        Self {
            polling_interval: Duration::from_millis(indexing.reindex_repo_polling_interval_ms),
            reindex_interval: Duration::from_millis(indexing.reindex_interval_ms),
            gc_grace_period: Duration::from_millis(indexing.repo_garbage_collection_grace_period_ms),
            job_timeout: Duration::from_millis(indexing.repo_index_timeout_ms),
            large_org_repo_threshold: indexing.large_org_repo_threshold,
        }
    }
}

/// Jobs created by one scheduling pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub index_jobs: usize,
    pub cleanup_jobs: usize,
}

/// Per-repository queue priority
///
/// Each multiple of `threshold` due repositories in one org lowers that
/// org's priority by one, so a single large org cannot starve the rest.
pub fn org_priorities(repos: &[Repo], threshold: usize) -> HashMap<i64, i32> {
    let mut per_org: HashMap<i32, usize> = HashMap::new();
    for repo in repos {
        let count = per_org.entry(repo.org_id).or_default();
        *count = count.saturating_add(1);
    }

    repos
        .iter()
        .map(|repo| {
            let due = per_org.get(&repo.org_id).copied().unwrap_or_default();
            let penalty = due
                .checked_div(threshold.max(1))
                .and_then(|p| i32::try_from(p).ok())
                .unwrap_or(i32::MAX);
            (repo.id, DEFAULT_PRIORITY.saturating_sub(penalty))
        })
        .collect()
}

/// Creates job rows and queue messages for due repositories
pub struct Scheduler {
    store: Arc<dyn RepoStore>,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<dyn JobMetrics>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RepoStore>,
        queue: Arc<dyn JobQueue>,
        metrics: Arc<dyn JobMetrics>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            metrics,
            settings,
        }
    }

    /// Poll every `polling_interval` until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            polling_interval_ms = self.settings.polling_interval.as_millis(),
            "Scheduler started"
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.settings.polling_interval) => {}
            }

            if let Err(e) = self.schedule_once(Utc::now()).await {
                error!(error = %e, "Scheduling pass failed");
            }
        }
        info!("Scheduler stopped");
    }

    /// One scheduling pass as of `now`
    pub async fn schedule_once(&self, now: DateTime<Utc>) -> IndexerResult<ScheduleReport> {
        let mut report = ScheduleReport::default();

        let to_index = self
            .store
            .find_index_candidates(now, self.settings.reindex_interval, self.settings.job_timeout)
            .await?;
        if !to_index.is_empty() {
            report.index_jobs = self.create_jobs(&to_index, JobType::Index).await?;
        }

        let to_cleanup = self
            .store
            .find_cleanup_candidates(now, self.settings.gc_grace_period, self.settings.job_timeout)
            .await?;
        if !to_cleanup.is_empty() {
            report.cleanup_jobs = self.create_jobs(&to_cleanup, JobType::Cleanup).await?;
        }

        Ok(report)
    }

    async fn create_jobs(&self, repos: &[Repo], job_type: JobType) -> IndexerResult<usize> {
        let jobs = self.store.create_jobs(repos, job_type).await?;
        let priorities = org_priorities(repos, self.settings.large_org_repo_threshold);
        let names: HashMap<i64, &str> = repos.iter().map(|r| (r.id, r.name.as_str())).collect();

        let items: Vec<EnqueueItem> = jobs
            .iter()
            .map(|job| EnqueueItem {
                payload: JobPayload {
                    job_id: job.id,
                    job_type,
                    repo_id: job.repo_id,
                    repo_name: names.get(&job.repo_id).copied().unwrap_or_default().to_string(),
                },
                priority: priorities.get(&job.repo_id).copied().unwrap_or(DEFAULT_PRIORITY),
            })
            .collect();

        self.queue.add_bulk(items.clone()).await?;

        for item in &items {
            self.metrics
                .adjust_pending(&item.payload.repo_name, job_type, 1.0);
        }
        info!(count = items.len(), "Scheduled {job_type} jobs");
        Ok(items.len())
    }
}
