//! Delivery キューに積むメッセージ

use super::{Outcome, TaskId};

/// One message for the owning thread.
#[derive(Debug, Clone)]
pub enum Delivery<T> {
    /// Exactly one per task.
    Finished { task_id: TaskId, outcome: Outcome<T> },

    /// At most one per stall (the watchdog tracks the notified flag).
    Stalled { task_id: TaskId },
}

impl<T> Delivery<T> {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Delivery::Finished { task_id, .. } | Delivery::Stalled { task_id } => task_id,
        }
    }
}
