//! Repository indexing orchestration for Repoweaver
//!
//! The [`RepoIndexManager`] schedules index and cleanup jobs, runs them on
//! [`QueueWorker`] pools under a per-repository lock, keeps working copies
//! fresh through a [`GitClient`] and hands revisions to an [`IndexBuilder`].
//! The [`ConnectionSyncer`] keeps repository rows in step with their
//! connections.

pub mod credentials;
pub mod error;
pub mod git;
pub mod index_builder;
pub mod manager;
pub mod revisions;
pub mod scheduler;
pub mod shards;
pub mod syncer;
pub mod telemetry;
// Test doubles for the manager seams, also used by downstream crates' tests
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod worker;

// Re-export error types
pub use error::{IndexerError, IndexerResult};

// Re-export main orchestration types
pub use credentials::{CredentialProvider, Credentials, NoCredentials, TokenCredentials};
pub use git::{CliGitClient, CommitLookup, GitClient, GitError, GitProgress};
pub use index_builder::{IndexBuildError, IndexBuilder, ZoektIndexBuilder};
pub use manager::{ManagerDeps, ManagerSettings, RepoIndexManager, RepoPath, repo_path};
pub use revisions::{MAX_REVISIONS, RevisionSet, build_revisions};
pub use scheduler::{ScheduleReport, Scheduler, SchedulerSettings};
pub use syncer::{
    ConnectionSyncer, LOCAL_GIT_CONNECTION_TYPE, LocalGitDiscovery, RepoDiscovery, SyncReport,
    SyncerSettings,
};
pub use telemetry::{Event, EventSink, JobMetrics, PrometheusJobMetrics, TracingEventSink};
pub use worker::{JobError, JobHandler, QueueWorker, WorkerConfig};
