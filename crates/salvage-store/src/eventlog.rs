use crate::StoreError;
use chrono::{DateTime, Utc};
use salvage_core::TaskState;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEventKind {
    Submitted,
    Dispatched { device_id: String, attempt: u32 },
    Completed { state: TaskState },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

impl TaskEvent {
    pub fn now(task_id: impl Into<String>, kind: TaskEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: task_id.into(),
            kind,
        }
    }
}

/// Append-only audit log, one JSON object per line.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn append(&self, event: &TaskEvent) -> Result<(), StoreError> {
        let mut line =
            serde_json::to_vec(event).map_err(|error| StoreError::Serde(error.to_string()))?;
        line.push(b'\n');
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?
                .write_all(&line)
        })
        .await
        .map_err(|join| StoreError::Join(join.to_string()))?
        .map_err(|error| StoreError::Io(error.to_string()))
    }
}
