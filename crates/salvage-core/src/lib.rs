pub mod errors;
pub mod model;

pub use errors::TaskError;
pub use model::{
    Device, DeviceCapabilities, DeviceStatus, FailureReason, Platform, Task, TaskFailure,
    TaskOutcome, TaskPriority, TaskRequirements, TaskSpec, TaskState,
};
