use crate::model::{Device, FailureReason, Platform, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Urgent,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    pub const COUNT: usize = 4;

    /// Band index, highest priority first.
    pub fn band(self) -> usize {
        self as usize
    }

    pub fn all() -> [TaskPriority; Self::COUNT] {
        [Self::Urgent, Self::High, Self::Normal, Self::Low]
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRequirements {
    pub min_cpu_cores: u32,
    pub min_memory_gb: f64,
    pub min_storage_gb: f64,
    pub required_platform: Option<Platform>,
    pub required_role: Option<String>,
    pub required_tags: BTreeSet<String>,
    pub gpu_required: bool,
    pub internet_required: bool,
    pub preferred_device_id: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

impl TaskRequirements {
    /// Capability clauses of the eligibility predicate. Status, advertised
    /// task types, and the concurrency cap are checked by the registry.
    pub fn satisfied_by(&self, device: &Device) -> bool {
        device.capabilities.cpu_cores >= self.min_cpu_cores
            && device.capabilities.memory_gb >= self.min_memory_gb
            && device.capabilities.storage_gb >= self.min_storage_gb
            && self.required_platform.map_or(true, |p| p == device.platform)
            && self
                .required_role
                .as_deref()
                .map_or(true, |role| role == device.role)
            && self.required_tags.is_subset(&device.capabilities.tags)
            && (!self.gpu_required || device.capabilities.has_gpu)
            && (!self.internet_required || device.capabilities.has_internet)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_type: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub requirements: TaskRequirements,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::default(),
            requirements: TaskRequirements::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        result: Value,
    },
    Failure {
        reason: FailureReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<TaskFailure>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: String,
    pub payload: Value,
    pub priority: TaskPriority,
    pub requirements: TaskRequirements,
    pub state: TaskState,
    pub assigned_device_id: Option<String>,
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<TaskOutcome>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec, default_timeout_seconds: u64, default_max_retries: u32) -> Self {
        let timeout_seconds = spec
            .requirements
            .timeout_seconds
            .unwrap_or(default_timeout_seconds);
        let max_retries = spec.requirements.max_retries.unwrap_or(default_max_retries);
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type: spec.task_type,
            payload: spec.payload,
            priority: spec.priority,
            requirements: spec.requirements,
            state: TaskState::Pending,
            assigned_device_id: None,
            attempts: 0,
            max_retries,
            timeout_seconds,
            created_at: Utc::now(),
            dispatched_at: None,
            finished_at: None,
            outcome: None,
        }
    }

    /// Total attempts are bounded by 1 + max_retries.
    pub fn retries_left(&self) -> bool {
        self.attempts <= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceCapabilities, DeviceStatus};
    use serde_json::json;

    fn device(cpu_cores: u32, memory_gb: f64) -> Device {
        Device {
            device_id: "d1".to_string(),
            role: "worker".to_string(),
            platform: Platform::Linux,
            architecture: "aarch64".to_string(),
            runtime_version: "0.1.0".to_string(),
            capabilities: DeviceCapabilities {
                cpu_cores,
                memory_gb,
                storage_gb: 32.0,
                has_gpu: false,
                has_internet: false,
                tags: ["arm".to_string(), "lan".to_string()].into_iter().collect(),
            },
            supported_task_types: vec!["echo".to_string()],
            max_concurrent_tasks: 2,
            address: None,
            status: DeviceStatus::Online,
            registered_at: Utc::now(),
            last_seen: Utc::now(),
            active_task_count: 0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
        }
    }

    #[test]
    fn priority_bands_order_urgent_first() {
        assert_eq!(TaskPriority::Urgent.band(), 0);
        assert_eq!(TaskPriority::Low.band(), 3);
        assert!(TaskPriority::Urgent < TaskPriority::High);
    }

    #[test]
    fn empty_requirements_accept_any_device() {
        let requirements = TaskRequirements::default();
        assert!(requirements.satisfied_by(&device(1, 0.5)));
    }

    #[test]
    fn cpu_floor_rejects_small_devices() {
        let requirements = TaskRequirements {
            min_cpu_cores: 4,
            ..TaskRequirements::default()
        };
        assert!(!requirements.satisfied_by(&device(2, 8.0)));
        assert!(requirements.satisfied_by(&device(8, 8.0)));
    }

    #[test]
    fn platform_and_role_are_exact_matches() {
        let requirements = TaskRequirements {
            required_platform: Some(Platform::Windows),
            ..TaskRequirements::default()
        };
        assert!(!requirements.satisfied_by(&device(4, 4.0)));

        let requirements = TaskRequirements {
            required_role: Some("storage".to_string()),
            ..TaskRequirements::default()
        };
        assert!(!requirements.satisfied_by(&device(4, 4.0)));
    }

    #[test]
    fn required_tags_are_a_subset_test() {
        let requirements = TaskRequirements {
            required_tags: ["arm".to_string()].into_iter().collect(),
            ..TaskRequirements::default()
        };
        assert!(requirements.satisfied_by(&device(4, 4.0)));

        let requirements = TaskRequirements {
            required_tags: ["arm".to_string(), "gpu-rig".to_string()]
                .into_iter()
                .collect(),
            ..TaskRequirements::default()
        };
        assert!(!requirements.satisfied_by(&device(4, 4.0)));
    }

    #[test]
    fn gpu_and_internet_flags_gate_eligibility() {
        let requirements = TaskRequirements {
            gpu_required: true,
            ..TaskRequirements::default()
        };
        assert!(!requirements.satisfied_by(&device(4, 4.0)));

        let requirements = TaskRequirements {
            internet_required: true,
            ..TaskRequirements::default()
        };
        assert!(!requirements.satisfied_by(&device(4, 4.0)));
    }

    #[test]
    fn from_spec_applies_configured_defaults() {
        let spec = TaskSpec::new("echo", json!({"msg": "hi"}));
        let task = Task::from_spec(spec, 120, 5);
        assert_eq!(task.timeout_seconds, 120);
        assert_eq!(task.max_retries, 5);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.outcome.is_none());
    }

    #[test]
    fn explicit_requirements_override_defaults() {
        let spec = TaskSpec {
            task_type: "echo".to_string(),
            payload: json!({}),
            priority: TaskPriority::High,
            requirements: TaskRequirements {
                timeout_seconds: Some(10),
                max_retries: Some(0),
                ..TaskRequirements::default()
            },
        };
        let task = Task::from_spec(spec, 300, 3);
        assert_eq!(task.timeout_seconds, 10);
        assert_eq!(task.max_retries, 0);
        assert_eq!(task.priority, TaskPriority::High);
    }

    #[test]
    fn retries_left_bounds_total_attempts() {
        let mut task = Task::from_spec(TaskSpec::new("echo", json!({})), 300, 2);
        task.attempts = 2;
        assert!(task.retries_left());
        task.attempts = 3;
        assert!(!task.retries_left());
    }

    #[test]
    fn two_submissions_yield_distinct_task_ids() {
        let a = Task::from_spec(TaskSpec::new("echo", json!({"v": 1})), 300, 3);
        let b = Task::from_spec(TaskSpec::new("echo", json!({"v": 1})), 300, 3);
        assert_ne!(a.task_id, b.task_id);
    }

    #[test]
    fn requirements_deserialize_with_partial_fields() {
        let requirements: TaskRequirements =
            serde_json::from_value(json!({"min_cpu_cores": 2, "gpu_required": true}))
                .expect("deserialize requirements");
        assert_eq!(requirements.min_cpu_cores, 2);
        assert!(requirements.gpu_required);
        assert!(requirements.timeout_seconds.is_none());
        assert!(requirements.required_tags.is_empty());
    }
}
