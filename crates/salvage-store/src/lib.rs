mod eventlog;
mod snapshot;

pub use eventlog::{EventLog, TaskEvent, TaskEventKind};
pub use snapshot::{JsonFileStore, RegistrySnapshot, SnapshotStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("blocking task join error: {0}")]
    Join(String),
}
