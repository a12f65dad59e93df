use crate::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use salvage_core::Device;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Durable view of the device registry. Restored on startup with every
/// device forced offline; task state is never part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub saved_at: DateTime<Utc>,
    pub devices: Vec<Device>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Option<RegistrySnapshot>, StoreError>;
    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), StoreError>;
}

/// Keeps the one registry snapshot in a single JSON file beside a `.lock`
/// guard and a `.staging` scratch file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<RegistrySnapshot>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || match fs::read(&path) {
            Ok(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|error| StoreError::Serde(error.to_string())),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StoreError::Io(error.to_string())),
        })
        .await
        .map_err(|join| StoreError::Join(join.to_string()))?
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|error| StoreError::Serde(error.to_string()))?;
        let path = self.path.clone();
        let lock_path = path.with_extension("lock");
        let staging_path = path.with_extension("staging");
        tokio::task::spawn_blocking(move || {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            // The advisory lock serializes writers (a second coordinator
            // pointed at the same file); the staged rename keeps a crash
            // mid-write from leaving a torn snapshot behind.
            let guard = fs::File::create(&lock_path)?;
            guard.lock_exclusive()?;
            let staged = fs::write(&staging_path, &body)
                .and_then(|()| fs::rename(&staging_path, &path));
            let released = FileExt::unlock(&guard);
            staged?;
            released
        })
        .await
        .map_err(|join| StoreError::Join(join.to_string()))?
        .map_err(|error: std::io::Error| StoreError::Io(error.to_string()))
    }
}
