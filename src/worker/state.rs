//! Worker lifecycle state machine.

use serde::{Deserialize, Serialize};

/// State of a polling worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Registered, loop not yet running.
    Created,
    /// Polling and dispatching batches.
    Active,
    /// Asked to stop; finishing the current iteration.
    Stopping,
    /// Loop has exited.
    Stopped,
}

impl WorkerState {
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Created, Active) | (Created, Stopping) | (Created, Stopped) |
            (Active, Stopping) | (Active, Stopped) |
            (Stopping, Stopped)
        )
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward_only() {
        assert!(WorkerState::Created.can_transition_to(WorkerState::Active));
        assert!(WorkerState::Active.can_transition_to(WorkerState::Stopping));
        assert!(WorkerState::Stopping.can_transition_to(WorkerState::Stopped));

        assert!(!WorkerState::Stopped.can_transition_to(WorkerState::Active));
        assert!(!WorkerState::Stopping.can_transition_to(WorkerState::Active));
        assert!(!WorkerState::Active.can_transition_to(WorkerState::Created));
    }

    #[test]
    fn display_and_serde_agree() {
        assert_eq!(WorkerState::Stopping.to_string(), "stopping");
        let json = serde_json::to_string(&WorkerState::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");
    }
}
