use thiserror::Error;

/// How a worker-side task handler reports failure. A retryable failure is
/// eligible for another dispatch attempt, subject to the task's retry
/// budget; a permanent one terminates the task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task failed but may succeed on another attempt: {0}")]
    Retryable(String),
    #[error("task failed for good: {0}")]
    Permanent(String),
}
