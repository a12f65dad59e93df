use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Assigned,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Failed,
    Timeout,
    Cancelled,
    DeviceLost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Assigned.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Timeout.is_terminal());
    }

    #[test]
    fn in_flight_states() {
        assert!(TaskState::Assigned.is_in_flight());
        assert!(TaskState::Running.is_in_flight());
        assert!(!TaskState::Queued.is_in_flight());
        assert!(!TaskState::Success.is_in_flight());
    }

    #[test]
    fn failure_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&FailureReason::DeviceLost).expect("serialize"),
            "\"device_lost\""
        );
    }
}
