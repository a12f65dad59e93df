use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("failed to bind listener: {0}")]
    Bind(String),
    #[error("listener error: {0}")]
    Listener(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("task queue is full")]
    QueueFull,
    #[error("coordinator is shutting down")]
    Shutdown,
}
