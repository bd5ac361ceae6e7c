use std::time::Duration;

use crate::job::{JobId, JobState};

/// Errors surfaced by [`JobStore`](crate::store::JobStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Optimistic-concurrency collision: the job's current state did not
    /// match the expected state. Dispatchers treat this as "someone else
    /// claimed it", not as a failure to surface.
    #[error("State conflict for job {id}: expected {expected}, found {actual}")]
    Conflict {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },
}

/// Caller errors rejected synchronously at enqueue time.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Queue name must not be empty")]
    EmptyQueueName,

    #[error("Queue is not configured: {0}")]
    UnknownQueue(String),

    #[error("Payload is {size} bytes, exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Payload is not serializable: {0}")]
    PayloadNotSerializable(#[from] serde_json::Error),

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Errors produced while executing a job body.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// Transient failure: network error, timeout at the transport layer, or a
    /// non-2xx response. Fed into the retry policy.
    #[error("{0}")]
    Failed(String),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("No executor registered for job kind: {0}")]
    UnknownKind(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

impl ExecuteError {
    /// Retrying cannot help a job nobody can execute or parse.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecuteError::Failed(_) | ExecuteError::Timeout(_) => true,
            ExecuteError::UnknownKind(_) | ExecuteError::MalformedPayload(_) => false,
        }
    }
}
