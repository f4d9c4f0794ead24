//! Worker lifecycle status and transition table
//!
//! A worker starts in `Initializing` and moves between the remaining states
//! only along the edges listed in [`WorkerStatus::can_transition`]. There is
//! no terminal state: stopping ends the worker outside the table.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{RuntimeError, RuntimeResult};

/// Lifecycle status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Constructed, not yet validated
    #[default]
    Initializing,
    /// Waiting for signals
    Idle,
    /// Strategy is planning instructions
    Planning,
    /// Executing a drain pass
    Running,
    /// Agent-directed signals are held in the queue
    Paused,
}

impl WorkerStatus {
    /// All statuses, in declaration order
    pub const ALL: [WorkerStatus; 5] = [
        WorkerStatus::Initializing,
        WorkerStatus::Idle,
        WorkerStatus::Planning,
        WorkerStatus::Running,
        WorkerStatus::Paused,
    ];

    /// Whether `self -> to` is an edge of the transition table
    pub fn can_transition(self, to: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, to),
            (Initializing, Idle)
                | (Idle, Idle)
                | (Idle, Planning)
                | (Idle, Running)
                | (Planning, Running)
                | (Planning, Idle)
                | (Running, Paused)
                | (Running, Idle)
                | (Paused, Running)
                | (Paused, Idle)
        )
    }

    /// Reason code naming the edge, or `None` if the edge is not allowed
    pub fn reason(self, to: WorkerStatus) -> Option<&'static str> {
        use WorkerStatus::*;
        let reason = match (self, to) {
            (Initializing, Idle) => "initialized",
            (Idle, Idle) => "noop",
            (Idle, Planning) => "plan",
            (Idle, Running) => "run",
            (Planning, Running) => "planned",
            (Planning, Idle) => "plan_aborted",
            (Running, Paused) => "pause",
            (Running, Idle) => "drained",
            (Paused, Running) => "resume",
            (Paused, Idle) => "reset",
            _ => return None,
        };
        Some(reason)
    }

    /// Move `self` to `to`, leaving it unchanged if the edge is not allowed
    pub fn transition(&mut self, to: WorkerStatus) -> RuntimeResult<()> {
        if self.can_transition(to) {
            *self = to;
            Ok(())
        } else {
            Err(RuntimeError::InvalidTransition { from: *self, to })
        }
    }

    /// Simple status name
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Initializing => "initializing",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Planning => "planning",
            WorkerStatus::Running => "running",
            WorkerStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = WorkerStatus> {
        prop::sample::select(WorkerStatus::ALL.to_vec())
    }

    #[test]
    fn test_initial_status() {
        assert_eq!(WorkerStatus::default(), WorkerStatus::Initializing);
    }

    #[test]
    fn test_no_path_back_to_initializing() {
        for from in WorkerStatus::ALL {
            assert!(!from.can_transition(WorkerStatus::Initializing));
        }
    }

    #[test]
    fn test_invalid_transition_leaves_status() {
        let mut status = WorkerStatus::Idle;
        let err = status.transition(WorkerStatus::Paused).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::InvalidTransition {
                from: WorkerStatus::Idle,
                to: WorkerStatus::Paused
            }
        ));
        assert_eq!(status, WorkerStatus::Idle);
    }

    proptest! {
        #[test]
        fn transition_matches_table(from in any_status(), to in any_status()) {
            let mut status = from;
            let result = status.transition(to);
            prop_assert_eq!(result.is_ok(), from.can_transition(to));
            prop_assert_eq!(from.reason(to).is_some(), from.can_transition(to));
            if result.is_ok() {
                prop_assert_eq!(status, to);
            } else {
                prop_assert_eq!(status, from);
            }
        }
    }
}
