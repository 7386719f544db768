//! Queue error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobState;

/// Result type used by the queue API.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced to callers of the queue.
///
/// Failures of a job's own command are never reported here; they are recorded
/// on the job record (`last_error` plus a state transition).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The enqueue request was malformed (e.g. empty command).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No job with this id exists.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A requeue was attempted on a job that is not in the dead-letter queue.
    #[error("job {id} is not in the dead-letter queue (state: {state})")]
    NotInDlq { id: JobId, state: JobState },

    /// A job with this id already exists.
    #[error("job already exists: {0}")]
    DuplicateId(JobId),

    /// The persistence backend failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A worker stopped abnormally (storage gave out, or the task panicked).
    #[error("worker failed: {0}")]
    WorkerFailed(String),
}

impl QueueError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}
