//! Structured error types for the indexing crate

use repoweaver_meta_data::{DatabaseError, LockError};
use thiserror::Error;

use crate::git::GitError;
use crate::index_builder::IndexBuildError;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    IndexBuild(#[from] IndexBuildError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A job observed in a state it can never legally be processed from
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl IndexerError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// True for errors caused by the job's token being cancelled
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Git(GitError::Cancelled) | Self::IndexBuild(IndexBuildError::Cancelled)
        )
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;
