//! タスクレベルのエラー分類
//!
//! ペイロードのエラーが panic や生のエラーのまま所有スレッドに届くことはない。
//! `Outcome::Failed(TaskError)` にまとめられ、他の Outcome と同じように
//! 配送される。

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error type payloads return. Anything `?`-convertible works.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Shared, cloneable error cause (outcomes are fanned out to several callers).
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Payload returned an error. The cause is kept as `source()`.
    #[error("operation failed: {0}")]
    OperationFailed(#[source] SharedError),

    /// Deadline exceeded. Distinct from a payload-reported failure.
    #[error("operation timed out after {0:?}")]
    OperationTimedOut(Duration),

    /// Caller- or watchdog-initiated. Callers do not treat this as an error.
    #[error("operation cancelled")]
    OperationCancelled,

    /// Payload panicked; the panic was caught on the pool thread.
    #[error("payload panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(cause: impl Into<BoxError>) -> Self {
        TaskError::OperationFailed(Arc::from(cause.into()))
    }

    /// Fold a payload's error. A `TaskError` passed through `?` is kept as is.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<TaskError>() {
            Ok(task_error) => *task_error,
            Err(other) => TaskError::OperationFailed(Arc::from(other)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::OperationCancelled)
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
