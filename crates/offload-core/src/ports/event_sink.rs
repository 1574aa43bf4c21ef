//! Event sink ports
//!
//! - `DeliveryHandler`: 終わった仕事をプレゼンテーション層から見た形。呼ぶのは
//!   Delivery キューを drain している所有スレッドだけ。
//! - `StallSink`: watchdog が stall を報告する先。runner は `Stalled` を結果と
//!   同じキューに積み、明示的な `cancel()` と同じ経路でキャンセルする。

use crate::domain::{Outcome, TaskError, TaskId};

pub trait DeliveryHandler<T> {
    fn on_result(&mut self, task_id: &TaskId, value: T);

    /// Failures and timeouts (`TaskError::OperationTimedOut`).
    fn on_error(&mut self, task_id: &TaskId, error: TaskError);

    fn on_cancelled(&mut self, task_id: &TaskId);

    fn on_stalled(&mut self, task_id: &TaskId);
}

/// Route one outcome to the matching handler method.
pub fn dispatch_outcome<T, H>(handler: &mut H, task_id: &TaskId, outcome: Outcome<T>)
where
    H: DeliveryHandler<T> + ?Sized,
{
    match outcome {
        Outcome::Completed(value) => handler.on_result(task_id, value),
        Outcome::Failed(error) => handler.on_error(task_id, error),
        Outcome::Cancelled => handler.on_cancelled(task_id),
        Outcome::TimedOut(after) => handler.on_error(task_id, TaskError::OperationTimedOut(after)),
    }
}

pub trait StallSink: Send + Sync {
    fn stalled(&self, task_id: &TaskId);
}

/// Sink that drops stall notices (watchdog used without a runner).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStallSink;

impl StallSink for NoopStallSink {
    fn stalled(&self, _task_id: &TaskId) {}
}
