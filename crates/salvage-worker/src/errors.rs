use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),
    #[error("registration was not acknowledged in time")]
    RegistrationTimeout,
}
