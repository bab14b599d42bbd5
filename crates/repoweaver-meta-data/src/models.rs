//! Domain models for database entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Kind of work a job performs on a repository
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobType {
    Index,
    Cleanup,
}

impl JobType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Index => "INDEX",
            Self::Cleanup => "CLEANUP",
        }
    }

    /// Lowercase label used in metrics
    pub const fn label(self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INDEX" => Ok(Self::Index),
            "CLEANUP" => Ok(Self::Cleanup),
            _ => Err(format!("Invalid job type: {s}")),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an indexing job
///
/// PENDING → IN_PROGRESS → {COMPLETED | FAILED}. Terminal states are never left.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// PENDING or IN_PROGRESS
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub const fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repository-level status shown to users
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepoIndexingStatus {
    New,
    InQueue,
    Indexing,
    Indexed,
    Failed,
    InGcQueue,
    GarbageCollecting,
    GarbageCollectionFailed,
}

impl RepoIndexingStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::InQueue => "IN_QUEUE",
            Self::Indexing => "INDEXING",
            Self::Indexed => "INDEXED",
            Self::Failed => "FAILED",
            Self::InGcQueue => "IN_GC_QUEUE",
            Self::GarbageCollecting => "GARBAGE_COLLECTING",
            Self::GarbageCollectionFailed => "GARBAGE_COLLECTION_FAILED",
        }
    }

    /// Repository status mirrored from a job status
    ///
    /// A completed cleanup has no repository status because the row is
    /// deleted.
    pub const fn from_job(job_type: JobType, status: JobStatus) -> Option<Self> {
        match (job_type, status) {
            (JobType::Index, JobStatus::Pending) => Some(Self::InQueue),
            (JobType::Index, JobStatus::InProgress) => Some(Self::Indexing),
            (JobType::Index, JobStatus::Completed) => Some(Self::Indexed),
            (JobType::Index, JobStatus::Failed) => Some(Self::Failed),
            (JobType::Cleanup, JobStatus::Pending) => Some(Self::InGcQueue),
            (JobType::Cleanup, JobStatus::InProgress) => Some(Self::GarbageCollecting),
            (JobType::Cleanup, JobStatus::Failed) => Some(Self::GarbageCollectionFailed),
            (JobType::Cleanup, JobStatus::Completed) => None,
        }
    }
}

impl std::str::FromStr for RepoIndexingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "IN_QUEUE" => Ok(Self::InQueue),
            "INDEXING" => Ok(Self::Indexing),
            "INDEXED" => Ok(Self::Indexed),
            "FAILED" => Ok(Self::Failed),
            "IN_GC_QUEUE" => Ok(Self::InGcQueue),
            "GARBAGE_COLLECTING" => Ok(Self::GarbageCollecting),
            "GARBAGE_COLLECTION_FAILED" => Ok(Self::GarbageCollectionFailed),
            _ => Err(format!("Invalid repo indexing status: {s}")),
        }
    }
}

impl std::fmt::Display for RepoIndexingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form repository settings stored as JSONB
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepoMetadata {
    /// Branch globs to index in addition to the default branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,

    /// Tag globs to index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    /// Git config overrides written into the working copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_config: Option<BTreeMap<String, String>>,

    /// Revisions included in the latest successful index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_revisions: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
}

/// A repository row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repo {
    pub id: i64,
    pub org_id: i32,
    pub name: String,
    pub display_name: Option<String>,
    /// Never contains credentials
    pub clone_url: String,
    pub web_url: Option<String>,
    pub image_url: Option<String>,
    pub default_branch: Option<String>,
    pub is_fork: bool,
    pub is_archived: bool,
    pub is_public: bool,
    pub is_auto_cleanup_disabled: bool,
    pub size_bytes: Option<i64>,
    pub metadata: RepoMetadata,
    pub external_id: String,
    pub external_code_host_type: String,
    pub external_code_host_url: String,
    pub indexing_status: RepoIndexingStatus,
    pub latest_indexing_job_status: Option<JobStatus>,
    pub indexed_at: Option<DateTime<Utc>>,
    pub indexed_commit_hash: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Job-scoped data carried from execution to completion
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_revisions: Option<Vec<String>>,
}

/// A row of `repo_indexing_jobs`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoIndexingJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub repo_id: i64,
    pub status: JobStatus,
    pub metadata: JobMetadata,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of a guarded job status change
#[derive(Debug, Clone)]
pub struct JobTransition {
    /// Status before the update
    pub previous_status: JobStatus,
    /// Job after the update
    pub job: RepoIndexingJob,
    /// Repository after the status mirror was applied
    pub repo: Repo,
}

/// Everything stamped onto a repository after a successful index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSuccess {
    /// `None` for a repository with no commits
    pub indexed_commit_hash: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub default_branch: Option<String>,
    pub indexed_revisions: Vec<String>,
}

/// Message body stored in the durable queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub repo_id: i64,
    pub repo_name: String,
}

/// A repository as produced by discovery, ready to be upserted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRepo {
    pub org_id: i32,
    pub name: String,
    pub display_name: Option<String>,
    pub clone_url: String,
    pub web_url: Option<String>,
    pub image_url: Option<String>,
    pub default_branch: Option<String>,
    pub is_fork: bool,
    pub is_archived: bool,
    pub is_public: bool,
    pub size_bytes: Option<i64>,
    pub metadata: RepoMetadata,
    pub external_id: String,
    pub external_code_host_type: String,
    pub external_code_host_url: String,
}

/// Outcome of syncing one connection's repositories
#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    /// Rows inserted by this sync
    pub created: Vec<Repo>,
    /// Count of rows that already existed and were refreshed
    pub updated: usize,
    /// Links to this connection dropped because the repo was not rediscovered
    pub unlinked: usize,
}

/// A configured code-host scope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub id: i64,
    pub org_id: i32,
    pub name: String,
    pub connection_type: String,
    pub config: serde_json::Value,
    pub synced_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mirror_mapping() {
        assert_eq!(
            RepoIndexingStatus::from_job(JobType::Index, JobStatus::Pending),
            Some(RepoIndexingStatus::InQueue)
        );
        assert_eq!(
            RepoIndexingStatus::from_job(JobType::Cleanup, JobStatus::InProgress),
            Some(RepoIndexingStatus::GarbageCollecting)
        );
        assert_eq!(
            RepoIndexingStatus::from_job(JobType::Cleanup, JobStatus::Failed),
            Some(RepoIndexingStatus::GarbageCollectionFailed)
        );
        assert_eq!(
            RepoIndexingStatus::from_job(JobType::Cleanup, JobStatus::Completed),
            None
        );
    }

    #[test]
    fn test_status_strings_parse_back() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("running".parse::<JobStatus>().is_err());
        assert_eq!("GARBAGE_COLLECTION_FAILED".parse(), Ok(RepoIndexingStatus::GarbageCollectionFailed));
    }

    #[test]
    fn test_repo_metadata_json_shape() {
        let metadata: RepoMetadata = serde_json::from_value(serde_json::json!({
            "branches": ["release/*"],
            "gitConfig": {"zoekt.name": "github.com/org/repo"},
            "unknownKey": true
        }))
        .unwrap_or_default();

        assert_eq!(metadata.branches, Some(vec!["release/*".to_string()]));
        assert_eq!(
            metadata
                .git_config
                .as_ref()
                .and_then(|c| c.get("zoekt.name"))
                .map(String::as_str),
            Some("github.com/org/repo")
        );
        assert!(metadata.tags.is_none());
    }

    #[test]
    fn test_payload_uses_camel_case() {
        let payload = JobPayload {
            job_id: Uuid::nil(),
            job_type: JobType::Cleanup,
            repo_id: 4,
            repo_name: "github.com/org/repo".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap_or_default();
        assert_eq!(value["jobType"], "CLEANUP");
        assert_eq!(value["repoId"], 4);
    }
}
