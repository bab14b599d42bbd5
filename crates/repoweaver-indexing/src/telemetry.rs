//! Job metrics and analytics events
//!
//! Both sinks are injected into the manager and syncer so tests can swap in
//! the recording implementations from [`crate::testing`].

use repoweaver_meta_data::JobType;
use serde::Serialize;
use uuid::Uuid;

pub const PENDING_JOBS: &str = "repo_index_jobs_pending";
pub const ACTIVE_JOBS: &str = "repo_index_jobs_active";
pub const JOB_SUCCESS_TOTAL: &str = "repo_index_job_success_total";
pub const JOB_FAIL_TOTAL: &str = "repo_index_job_fail_total";
pub const JOB_REATTEMPTS_TOTAL: &str = "repo_index_job_reattempts_total";

/// Per-repository job counters and gauges, labeled by repo name and job type
pub trait JobMetrics: Send + Sync {
    fn adjust_pending(&self, repo: &str, job_type: JobType, delta: f64);

    fn adjust_active(&self, repo: &str, job_type: JobType, delta: f64);

    fn record_success(&self, repo: &str, job_type: JobType);

    fn record_failure(&self, repo: &str, job_type: JobType);

    /// An attempt failed and the job will be retried
    fn record_reattempt(&self, repo: &str, job_type: JobType);
}

/// Publishes through the `metrics` facade; the binary installs the
/// Prometheus recorder
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusJobMetrics;

impl PrometheusJobMetrics {
    /// Register metric descriptions with the installed recorder
    pub fn describe() {
        metrics::describe_gauge!(PENDING_JOBS, "Jobs waiting in the queue");
        metrics::describe_gauge!(ACTIVE_JOBS, "Jobs currently being processed");
        metrics::describe_counter!(JOB_SUCCESS_TOTAL, "Jobs completed successfully");
        metrics::describe_counter!(JOB_FAIL_TOTAL, "Jobs that failed permanently");
        metrics::describe_counter!(JOB_REATTEMPTS_TOTAL, "Failed attempts that were retried");
    }
}

impl JobMetrics for PrometheusJobMetrics {
    fn adjust_pending(&self, repo: &str, job_type: JobType, delta: f64) {
        metrics::gauge!(PENDING_JOBS, "repo" => repo.to_string(), "type" => job_type.label())
            .increment(delta);
    }

    fn adjust_active(&self, repo: &str, job_type: JobType, delta: f64) {
        metrics::gauge!(ACTIVE_JOBS, "repo" => repo.to_string(), "type" => job_type.label())
            .increment(delta);
    }

    fn record_success(&self, repo: &str, job_type: JobType) {
        metrics::counter!(JOB_SUCCESS_TOTAL, "repo" => repo.to_string(), "type" => job_type.label())
            .increment(1);
    }

    fn record_failure(&self, repo: &str, job_type: JobType) {
        metrics::counter!(JOB_FAIL_TOTAL, "repo" => repo.to_string(), "type" => job_type.label())
            .increment(1);
    }

    fn record_reattempt(&self, repo: &str, job_type: JobType) {
        metrics::counter!(
            JOB_REATTEMPTS_TOTAL,
            "repo" => repo.to_string(),
            "type" => job_type.label()
        )
        .increment(1);
    }
}

/// Product analytics events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    RepoCreated {
        repo_id: i64,
        org_id: i32,
        connection_id: i64,
    },
    RepoDeleted {
        repo_id: i64,
        org_id: i32,
    },
    RepoSynced {
        connection_id: i64,
        org_id: i32,
        repo_count: usize,
        created: usize,
        unlinked: usize,
    },
    BackendRepoFirstIndexed {
        repo_id: i64,
        org_id: i32,
    },
    BackendRepoIndexJobFailed {
        repo_id: i64,
        job_id: Uuid,
        job_type: JobType,
        error: String,
    },
    BackendRevisionsTruncated {
        repo_id: i64,
        revision_count: usize,
    },
}

impl Event {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RepoCreated { .. } => "repo_created",
            Self::RepoDeleted { .. } => "repo_deleted",
            Self::RepoSynced { .. } => "repo_synced",
            Self::BackendRepoFirstIndexed { .. } => "backend_repo_first_indexed",
            Self::BackendRepoIndexJobFailed { .. } => "backend_repo_index_job_failed",
            Self::BackendRevisionsTruncated { .. } => "backend_revisions_truncated",
        }
    }
}

/// Destination for analytics events; capture never fails the caller
pub trait EventSink: Send + Sync {
    fn capture(&self, event: Event);
}

/// Writes each event as a structured log record on `repoweaver::events`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn capture(&self, event: Event) {
        let properties = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(
            target: "repoweaver::events",
            event = event.name(),
            properties = %properties,
            "captured event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_uses_wire_names() {
        let event = Event::BackendRevisionsTruncated {
            repo_id: 7,
            revision_count: 101,
        };
        let value = serde_json::to_value(&event).unwrap_or_default();

        assert_eq!(value["event"], "backend_revisions_truncated");
        assert_eq!(value["repoId"], 7);
        assert_eq!(value["revisionCount"], 101);
        assert_eq!(event.name(), "backend_revisions_truncated");
    }

    #[test]
    fn test_failed_event_carries_job_type() {
        let event = Event::BackendRepoIndexJobFailed {
            repo_id: 1,
            job_id: Uuid::nil(),
            job_type: JobType::Cleanup,
            error: "boom".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(value["event"], "backend_repo_index_job_failed");
        assert_eq!(value["jobType"], "CLEANUP");
    }

    #[test]
    fn test_prometheus_metrics_without_recorder_is_a_noop() {
        let metrics = PrometheusJobMetrics;
        metrics.adjust_pending("github.com/org/repo", JobType::Index, 1.0);
        metrics.record_success("github.com/org/repo", JobType::Index);
    }
}
