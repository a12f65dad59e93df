use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    Windows,
    Macos,
    Android,
    Other,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::Macos => "macos",
            Self::Android => "android",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub cpu_cores: u32,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub has_gpu: bool,
    pub has_internet: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            memory_gb: 0.0,
            storage_gb: 0.0,
            has_gpu: false,
            has_internet: false,
            tags: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub role: String,
    pub platform: Platform,
    pub architecture: String,
    pub runtime_version: String,
    pub capabilities: DeviceCapabilities,
    pub supported_task_types: Vec<String>,
    pub max_concurrent_tasks: u32,
    pub address: Option<String>,
    pub status: DeviceStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active_task_count: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl Device {
    pub fn supports(&self, task_type: &str) -> bool {
        self.supported_task_types.iter().any(|t| t == task_type)
    }

    pub fn has_capacity(&self) -> bool {
        self.active_task_count < self.max_concurrent_tasks
    }
}
