//! Runner の状態スナップショット

use serde::Serialize;

/// Point-in-time counts, taken under the table lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub pool_size: usize,
    /// Queued, not yet on a pool thread.
    pub pending: usize,
    /// Status `Running`.
    pub running: usize,
    /// Payloads occupying a pool thread, including ones whose task already
    /// timed out or was cancelled.
    pub executing: usize,
    /// Terminal, delivery not yet taken by the owning thread.
    pub awaiting_ack: usize,
    /// Payloads that ignored cancellation past the leak grace and still run.
    pub leaked_workers: usize,
}

impl RunnerStats {
    /// Pool threads free to take work.
    pub fn idle_workers(&self) -> usize {
        self.pool_size.saturating_sub(self.executing)
    }
}
