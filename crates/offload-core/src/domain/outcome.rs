//! Outcome モデル - すべての終端結果が取る唯一の形
//!
//! 成功値、ペイロードの失敗、タイムアウト、キャンセルを同じ判別共用体で運ぶ
//! ので、所有スレッドは 1 つの型に match すればよい。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{TaskError, TaskStatus};

/// Classification of a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Completed(T),
    Failed(TaskError),
    Cancelled,
    TimedOut(Duration),
}

impl<T> Outcome<T> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Completed(_) => OutcomeKind::Completed,
            Outcome::Failed(_) => OutcomeKind::Failed,
            Outcome::Cancelled => OutcomeKind::Cancelled,
            Outcome::TimedOut(_) => OutcomeKind::TimedOut,
        }
    }

    /// Terminal status this outcome records on the task.
    pub fn status(&self) -> TaskStatus {
        match self {
            Outcome::Completed(_) => TaskStatus::Completed,
            Outcome::Failed(_) => TaskStatus::Failed,
            Outcome::Cancelled => TaskStatus::Cancelled,
            Outcome::TimedOut(_) => TaskStatus::TimedOut,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Completed(v) => Some(v),
            _ => None,
        }
    }

    /// Collapse into a `Result`.
    pub fn into_result(self) -> Result<T, TaskError> {
        match self {
            Outcome::Completed(v) => Ok(v),
            Outcome::Failed(e) => Err(e),
            Outcome::Cancelled => Err(TaskError::OperationCancelled),
            Outcome::TimedOut(after) => Err(TaskError::OperationTimedOut(after)),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(v) => Outcome::Completed(f(v)),
            Outcome::Failed(e) => Outcome::Failed(e),
            Outcome::Cancelled => Outcome::Cancelled,
            Outcome::TimedOut(after) => Outcome::TimedOut(after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn outcome_kind_serializes_as_screaming_snake() {
        let s = serde_json::to_string(&OutcomeKind::TimedOut).unwrap();
        assert_eq!(s, "\"TIMED_OUT\"");

        let s = serde_json::to_string(&OutcomeKind::Completed).unwrap();
        assert_eq!(s, "\"COMPLETED\"");
    }

    #[rstest]
    #[case::completed(Outcome::Completed(1), TaskStatus::Completed)]
    #[case::failed(Outcome::Failed(TaskError::failed("x")), TaskStatus::Failed)]
    #[case::cancelled(Outcome::Cancelled, TaskStatus::Cancelled)]
    #[case::timed_out(Outcome::TimedOut(Duration::from_secs(2)), TaskStatus::TimedOut)]
    fn every_outcome_maps_to_a_terminal_status(#[case] outcome: Outcome<i32>, #[case] status: TaskStatus) {
        assert_eq!(outcome.status(), status);
        assert!(outcome.status().is_terminal());
    }

    #[test]
    fn into_result_keeps_failures_apart_from_cancellation() {
        assert_eq!(Outcome::Completed(5).into_result().unwrap(), 5);
        assert!(Outcome::<i32>::Cancelled.into_result().unwrap_err().is_cancelled());
        assert!(matches!(
            Outcome::<i32>::TimedOut(Duration::from_secs(2)).into_result(),
            Err(TaskError::OperationTimedOut(d)) if d == Duration::from_secs(2)
        ));
    }

    #[test]
    fn map_only_touches_values() {
        let o = Outcome::Completed(2).map(|v| v * 10);
        assert_eq!(o.value(), Some(&20));
        let o: Outcome<i32> = Outcome::<i32>::Cancelled.map(|v| v * 10);
        assert_eq!(o.kind(), OutcomeKind::Cancelled);
    }
}
