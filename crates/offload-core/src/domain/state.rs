//! タスクの状態機械

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Pending -> Running -> Completed | Failed | Cancelled | TimedOut
/// - Pending -> Cancelled (cancelled before dispatch)
///
/// Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting for a pool thread.
    Pending,

    /// Currently executing on a pool thread.
    Running,

    /// Payload returned a value.
    Completed,

    /// Payload returned an error or panicked.
    Failed,

    /// Cancelled by the caller or by the watchdog.
    Cancelled,

    /// Deadline passed before the payload returned.
    TimedOut,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }

    /// Is `next` a legal successor of `self`?
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled) => true,
            (TaskStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}
