//! Repoweaver data layer for `PostgreSQL` state management
//!
//! Repository and job rows, the durable job queue, per-repository leases and
//! the descriptor compiler that turns discovered repositories into rows.

pub mod descriptor;
pub mod error;
pub mod job_queue;
pub mod lock;
pub mod migrations;
pub mod models;
pub mod pool_manager;
pub mod repository;
pub mod traits;

pub mod mock;
pub mod mock_queue;
pub use mock::MockRepoStore;
pub use mock_queue::MockJobQueue;

// Public exports
pub use descriptor::{
    DiscoveryResult, RepoDescriptor, RevisionFilters, compile_local_git_descriptors,
    is_git_repo_root, normalize_git_url, strip_url_credentials,
};
pub use error::{DatabaseError, DatabaseErrorExt, DatabaseOperation, DatabaseResult};
pub use job_queue::{
    EnqueueItem, FailOutcome, JobQueue, PostgresJobQueue, QueueDepth, ReservedJob, StalledJob,
};
pub use lock::{DistributedLock, InMemoryLeaseStore, LeaseStore, LockError, PostgresLeaseStore};
pub use migrations::{run_migrations, wait_for_migrations};
pub use models::*;
pub use pool_manager::{PoolConfig, PoolManager};
pub use repository::DbRepoStore;
pub use repoweaver_config::DatabaseConfig;
pub use traits::RepoStore;
