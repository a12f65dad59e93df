mod device;
mod status;
mod task;

pub use device::{Device, DeviceCapabilities, DeviceStatus, Platform};
pub use status::{FailureReason, TaskState};
pub use task::{Task, TaskFailure, TaskOutcome, TaskPriority, TaskRequirements, TaskSpec};
