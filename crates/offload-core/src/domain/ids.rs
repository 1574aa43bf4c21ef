//! タスク識別子
//!
//! `TaskId` は不透明な文字列。呼び出し側が自分で決めてもよいし（"scan-1"）、
//! `IdGenerator` port に発行させてもよい（`task-<ULID>`）。一意性を強制するのは
//! runner がまだ追跡しているタスクの間だけで、配送されて受け取られた後は
//! 同じ id を再投入できる。

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Prefix used for generated ids.
pub const GENERATED_PREFIX: &str = "task-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Build a generated id from a ULID.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(format!("{GENERATED_PREFIX}{ulid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_supplied_ids_keep_their_text() {
        let id = TaskId::new("scan-1");
        assert_eq!(id.as_str(), "scan-1");
        assert_eq!(id.to_string(), "scan-1");
        assert_eq!(TaskId::from("scan-1"), id);
    }

    #[test]
    fn generated_ids_carry_the_prefix() {
        let ulid = Ulid::new();
        let id = TaskId::from_ulid(ulid);
        assert!(id.as_str().starts_with(GENERATED_PREFIX));
        assert!(id.as_str().ends_with(&ulid.to_string()));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = TaskId::new("vt-lookup");
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"vt-lookup\"");
        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }
}
