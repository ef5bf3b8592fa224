use thiserror::Error;

use crate::domain::TaskId;

/// Errors raised by a backing store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A fetched document cannot be read as a task record.
    #[error("invalid task document (id={id:?}): {reason}")]
    InvalidDocument { id: Option<String>, reason: String },

    #[error("duplicate task id {0}")]
    DuplicateKey(TaskId),

    #[error("backing store error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }

    pub fn invalid(id: Option<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDocument {
            id,
            reason: reason.into(),
        }
    }
}

/// Configuration rejected at queue construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ttl must be -1 (never expire) or a non-negative number of seconds, got {0}")]
    InvalidTtl(i64),

    #[error("max_retries must be at least 1")]
    InvalidMaxRetries,

    #[error("worker tag must not be empty")]
    EmptyWorkerTag,

    #[error("unknown discard strategy {0:?} (expected \"keep\" or \"remove\")")]
    UnknownDiscardStrategy(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The store did not acknowledge a write. Never retried inside the queue.
    #[error("backing store did not acknowledge {operation}")]
    WriteRejected { operation: &'static str },

    /// The task was reassigned elsewhere; the caller must drop its local result.
    #[error("lease on {task_id} is no longer held by {worker}")]
    LeaseLost { task_id: TaskId, worker: String },

    #[error("{operation} affected {affected} of {requested} documents")]
    PartialBatchFailure {
        operation: &'static str,
        requested: usize,
        affected: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl QueueError {
    /// Recoverable outcomes that the caller may handle and move on from.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QueueError::LeaseLost { .. } | QueueError::PartialBatchFailure { .. }
        )
    }

    pub fn is_invalid_document(&self) -> bool {
        matches!(self, QueueError::Store(StoreError::InvalidDocument { .. }))
    }
}
