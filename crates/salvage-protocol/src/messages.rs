use chrono::{DateTime, Utc};
use salvage_core::{DeviceCapabilities, Platform, TaskFailure};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Common envelope carried by every frame in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(sender_id: impl Into<String>, payload: Payload) -> Self {
        Self::with_message_id(sender_id, Uuid::new_v4().to_string(), payload)
    }

    pub fn with_message_id(
        sender_id: impl Into<String>,
        message_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            message_id: Some(message_id.into()),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Register(RegisterData),
    RegisterAck(RegisterAckData),
    Heartbeat(HeartbeatData),
    HeartbeatAck(HeartbeatAckData),
    TaskAssign(TaskAssignData),
    TaskResult(TaskResultData),
    TaskCancel(TaskCancelData),
    StatusQuery(StatusQueryData),
    StatusReply(StatusReplyData),
    Error(ErrorData),
}

impl Payload {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::RegisterAck(_) => "register_ack",
            Self::Heartbeat(_) => "heartbeat",
            Self::HeartbeatAck(_) => "heartbeat_ack",
            Self::TaskAssign(_) => "task_assign",
            Self::TaskResult(_) => "task_result",
            Self::TaskCancel(_) => "task_cancel",
            Self::StatusQuery(_) => "status_query",
            Self::StatusReply(_) => "status_reply",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterData {
    pub device_id: String,
    pub role: String,
    pub platform: Platform,
    pub architecture: String,
    pub runtime_version: String,
    pub capabilities: DeviceCapabilities,
    #[serde(default)]
    pub supported_task_types: Vec<String>,
    pub max_concurrent_tasks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAckData {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub assigned_device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub active_tasks: u32,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAckData {
    pub server_time: DateTime<Utc>,
    pub pending_task_hint: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignData {
    pub task_id: String,
    pub task_type: String,
    pub payload: Value,
    pub timeout_seconds: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultData {
    pub task_id: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    pub execution_time_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCancelData {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusQueryData {}

/// Diagnostic reply correlated to the request (or, for a `task_assign`
/// acknowledgement, to the assignment's `message_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReplyData {
    pub in_reply_to: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}
