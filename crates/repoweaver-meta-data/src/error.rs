//! Structured error handling for the data layer
//!
//! Every database call is wrapped with a [`DatabaseOperation`] so failures
//! carry the repository, job or queue row they were working on.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for database operations
pub type DatabaseResult<T> = std::result::Result<T, DatabaseError>;

/// Database operation type for error context
#[derive(Debug, Clone)]
pub enum DatabaseOperation {
    /// Scheduling scans
    FindIndexCandidates,
    FindCleanupCandidates,
    CreateJobs {
        job_type: String,
        count: usize,
    },

    /// Job lifecycle
    GetJob {
        job_id: Uuid,
    },
    StartJob {
        job_id: Uuid,
    },
    CompleteJob {
        job_id: Uuid,
    },
    FailJob {
        job_id: Uuid,
    },
    SetJobMetadata {
        job_id: Uuid,
    },

    /// Repository rows
    GetRepo {
        repo_id: i64,
    },
    RecordIndexSuccess {
        repo_id: i64,
    },
    DeleteRepo {
        repo_id: i64,
    },
    UpsertRepos {
        connection_id: i64,
        count: usize,
    },

    /// Connections
    ConnectionsDueForSync,
    MarkConnectionSynced {
        connection_id: i64,
    },

    /// Durable queue
    QueueAdd {
        count: usize,
    },
    QueueReserve {
        job_type: String,
    },
    QueueUpdate {
        queue_id: Uuid,
        action: &'static str,
    },
    QueueRecoverStalled,

    /// Leases
    Lease {
        key: String,
        action: &'static str,
    },

    /// Generic operations
    Query {
        description: String,
    },
}

impl fmt::Display for DatabaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FindIndexCandidates => write!(f, "find_index_candidates"),
            Self::FindCleanupCandidates => write!(f, "find_cleanup_candidates"),
            Self::CreateJobs { job_type, count } => {
                write!(f, "create_jobs(type={job_type}, count={count})")
            }

            Self::GetJob { job_id } => write!(f, "get_job(job_id={job_id})"),
            Self::StartJob { job_id } => write!(f, "start_job(job_id={job_id})"),
            Self::CompleteJob { job_id } => write!(f, "complete_job(job_id={job_id})"),
            Self::FailJob { job_id } => write!(f, "fail_job(job_id={job_id})"),
            Self::SetJobMetadata { job_id } => write!(f, "set_job_metadata(job_id={job_id})"),

            Self::GetRepo { repo_id } => write!(f, "get_repo(repo={repo_id})"),
            Self::RecordIndexSuccess { repo_id } => {
                write!(f, "record_index_success(repo={repo_id})")
            }
            Self::DeleteRepo { repo_id } => write!(f, "delete_repo(repo={repo_id})"),
            Self::UpsertRepos {
                connection_id,
                count,
            } => write!(f, "upsert_repos(connection={connection_id}, count={count})"),

            Self::ConnectionsDueForSync => write!(f, "connections_due_for_sync"),
            Self::MarkConnectionSynced { connection_id } => {
                write!(f, "mark_connection_synced(connection={connection_id})")
            }

            Self::QueueAdd { count } => write!(f, "queue_add(count={count})"),
            Self::QueueReserve { job_type } => write!(f, "queue_reserve(type={job_type})"),
            Self::QueueUpdate { queue_id, action } => {
                write!(f, "queue_{action}(id={queue_id})")
            }
            Self::QueueRecoverStalled => write!(f, "queue_recover_stalled"),

            Self::Lease { key, action } => write!(f, "lease_{action}(key={key})"),

            Self::Query { description } => write!(f, "query({description})"),
        }
    }
}

/// Comprehensive database error with full context
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Query timeout
    #[error(
        "Query timeout for operation '{operation}' (correlation_id={correlation_id:?})"
    )]
    QueryTimeout {
        operation: Box<DatabaseOperation>,
        correlation_id: Option<String>,
        #[source]
        source: sqlx::Error,
    },

    /// Query execution error
    #[error(
        "Query failed for operation '{operation}': {message} (correlation_id={correlation_id:?})"
    )]
    QueryFailed {
        operation: Box<DatabaseOperation>,
        message: String,
        correlation_id: Option<String>,
        #[source]
        source: sqlx::Error,
    },

    /// Constraint violation
    #[error(
        "Database constraint violation in table '{table}': {constraint} (operation='{operation}', correlation_id={correlation_id:?})"
    )]
    ConstraintViolation {
        table: String,
        constraint: String,
        operation: Box<DatabaseOperation>,
        correlation_id: Option<String>,
        #[source]
        source: sqlx::Error,
    },

    /// A row the operation depends on no longer exists
    #[error("{entity} {id} not found (operation='{operation}')")]
    NotFound {
        entity: &'static str,
        id: String,
        operation: Box<DatabaseOperation>,
    },

    /// Migration error
    #[error("Database migration failed: {message} (correlation_id={correlation_id:?})")]
    MigrationFailed {
        message: String,
        correlation_id: Option<String>,
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    /// Unexpected database state
    #[error(
        "Unexpected database state for operation '{operation}': {message} (correlation_id={correlation_id:?})"
    )]
    UnexpectedState {
        operation: Box<DatabaseOperation>,
        message: String,
        correlation_id: Option<String>,
    },
}

impl DatabaseError {
    /// Create a new query failed error from `sqlx::Error`
    pub fn query_failed(
        operation: DatabaseOperation,
        source: sqlx::Error,
        correlation_id: Option<String>,
    ) -> Self {
        let message = source.to_string();

        if let Some(db_err) = source.as_database_error()
            && let Some(constraint) = db_err.constraint()
        {
            let table = db_err
                .table()
                .map(String::from)
                .or_else(|| Self::extract_table_from_constraint(constraint))
                .unwrap_or_else(|| "unknown".to_string());

            return Self::ConstraintViolation {
                table,
                constraint: constraint.to_string(),
                operation: Box::new(operation),
                correlation_id,
                source,
            };
        }

        if matches!(source, sqlx::Error::PoolTimedOut)
            || message.contains("timeout")
            || message.contains("timed out")
        {
            return Self::QueryTimeout {
                operation: Box::new(operation),
                correlation_id,
                source,
            };
        }

        Self::QueryFailed {
            operation: Box::new(operation),
            message,
            correlation_id,
            source,
        }
    }

    /// Create a not-found error for a repository or job row
    pub fn not_found(entity: &'static str, id: impl fmt::Display, operation: DatabaseOperation) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
            operation: Box::new(operation),
        }
    }

    /// Extract table name from constraint name (assumes format: `table_constraint`)
    fn extract_table_from_constraint(constraint: &str) -> Option<String> {
        constraint.split('_').next().map(String::from)
    }
}

/// Extension trait for converting sqlx errors with context
pub trait DatabaseErrorExt<T> {
    /// Convert to `DatabaseError` with operation context
    ///
    /// # Errors
    /// Returns `DatabaseError` with operation context and correlation ID
    fn map_db_err(
        self,
        operation: DatabaseOperation,
        correlation_id: Option<String>,
    ) -> DatabaseResult<T>;
}

impl<T> DatabaseErrorExt<T> for std::result::Result<T, sqlx::Error> {
    fn map_db_err(
        self,
        operation: DatabaseOperation,
        correlation_id: Option<String>,
    ) -> DatabaseResult<T> {
        self.map_err(|e| DatabaseError::query_failed(operation, e, correlation_id))
    }
}
