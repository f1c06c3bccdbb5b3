use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle states.
///
/// PENDING and PROCESSING are the only states from which further automatic
/// progress occurs; the remaining four are terminal. The wire representation
/// is upper-case to match the status strings exposed to gateway clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created and enqueued, waiting for dispatch
    Pending,
    /// Dispatched to a worker, execution in flight
    Processing,
    /// Worker reported a result
    Success,
    /// Worker reported an error and the attempt budget is exhausted
    Failed,
    /// No completion arrived within the deadline and the budget is exhausted
    Timeout,
    /// Cancelled by external request
    Cancelled,
}

impl TaskStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Check if the task is currently assigned to a worker
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing)
    }

    /// Check if the task is eligible for dispatch
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Whether the finite state machine permits `self -> target`.
    ///
    /// The whitelist: PENDING→PROCESSING, PROCESSING→PENDING (retry),
    /// PROCESSING→SUCCESS, PROCESSING→{FAILED, TIMEOUT}, and any
    /// non-terminal→CANCELLED. Everything else is a defect.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Pending)
                | (Self::Processing, Self::Success)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Timeout)
                | (Self::Pending, Self::Cancelled)
                | (Self::Processing, Self::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "TIMEOUT" => Ok(Self::Timeout),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Success,
        TaskStatus::Failed,
        TaskStatus::Timeout,
        TaskStatus::Cancelled,
    ];

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn normal_path_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Success));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Timeout));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn cancellation_only_from_non_terminal() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn no_resurrection_from_terminal() {
        for terminal in ALL.iter().filter(|s| s.is_terminal()) {
            for target in ALL {
                assert!(
                    !terminal.can_transition_to(target),
                    "{terminal} -> {target} must be rejected"
                );
            }
        }
    }

    #[test]
    fn status_string_round_trip() {
        for status in ALL {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("pending".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn status_serde_is_upper_case() {
        let json = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Processing);
    }

    proptest! {
        // Walking any sequence of permitted transitions never leaves a
        // terminal state and never reaches PENDING from SUCCESS/FAILED.
        #[test]
        fn random_walks_respect_the_whitelist(steps in proptest::collection::vec(0usize..6, 0..32)) {
            let mut current = TaskStatus::Pending;
            for step in steps {
                let target = ALL[step];
                if current.can_transition_to(target) {
                    prop_assert!(!current.is_terminal());
                    current = target;
                }
            }
        }
    }
}
