//! TaskRecord - runner が 1 つの仕事について追跡するメタデータ

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::{TaskId, TaskStatus};

/// Metadata for a task owned by the runner.
///
/// Design:
/// - This is the single source of truth for task status.
/// - The pending queue holds TaskIds only.
/// - All state transitions happen here.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,

    /// Task class the timeout and stall threshold were resolved from.
    pub class: Option<String>,

    pub timeout: Duration,

    /// `None` disables stall detection for this task.
    pub stall_threshold: Option<Duration>,

    pub status: TaskStatus,

    /// Wall-clock submission time (for status views).
    pub created_at: DateTime<Utc>,

    /// Monotonic timestamps.
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        class: Option<String>,
        timeout: Duration,
        stall_threshold: Option<Duration>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            class,
            timeout,
            stall_threshold,
            status: TaskStatus::Pending,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Pending -> Running. Returns false if the task is no longer pending.
    pub fn start(&mut self) -> bool {
        if !self.status.can_transition_to(TaskStatus::Running) {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Instant::now());
        true
    }

    /// Move into a terminal state.
    ///
    /// Returns false (and changes nothing) if the task already reached a
    /// terminal state or the transition is otherwise illegal. Every terminal
    /// delivery in the runner is gated on this returning true.
    pub fn finish(&mut self, terminal: TaskStatus) -> bool {
        if !terminal.is_terminal() || !self.status.can_transition_to(terminal) {
            return false;
        }
        self.status = terminal;
        self.finished_at = Some(Instant::now());
        true
    }

    /// `None` before start, or when the timeout is too large to represent.
    pub fn deadline(&self) -> Option<Instant> {
        self.started_at.and_then(|at| at.checked_add(self.timeout))
    }
}
