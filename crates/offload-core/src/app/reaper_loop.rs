//! ReaperLoop - 期限切れと leak したワーカーの処理
//!
//! - 期限を過ぎた Running タスクは `TimedOut` になり、トークンが立つ。
//!   ペイロードが気づくまでプールスレッドは占有されたまま。
//! - トークンが立ってから `leak_grace` を過ぎても動き続けるペイロードは
//!   leak したワーカー。1 回だけログに出してカウントし、タスクがまだ
//!   Running なら `Cancelled` として配送する。
//!
//! reaper は `reaper_wake` 上で一番近い期限まで眠る。待つのは何も見つからな
//! かった走査の直後、同じクリティカルセクション内だけなので、走査と待機の
//! 間で起床通知を取りこぼさない。

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::app::context::CancelToken;
use crate::app::runtime::{Shared, Table};
use crate::domain::{Outcome, TaskId, TaskStatus};

enum Reaped {
    TimedOut {
        task_id: TaskId,
        token: CancelToken,
        after: Duration,
    },
    Leaked {
        task_id: TaskId,
        token: CancelToken,
    },
}

pub(crate) fn reaper_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
    tracing::debug!("reaper started");
    loop {
        let reaped = {
            let mut table = shared.lock_table();
            loop {
                if table.stopping {
                    tracing::debug!("reaper stopped");
                    return;
                }
                let now = Instant::now();
                let reaped = scan(&mut table, &shared, now);
                if !reaped.is_empty() {
                    break reaped;
                }
                table = match next_wake(&table, &shared, now) {
                    Some(sleep) => {
                        shared
                            .reaper_wake
                            .wait_timeout(table, sleep)
                            .unwrap_or_else(|e| e.into_inner())
                            .0
                    }
                    None => shared.reaper_wake.wait(table).unwrap_or_else(|e| e.into_inner()),
                };
            }
        };

        for reaped in reaped {
            match reaped {
                Reaped::TimedOut { task_id, token, after } => {
                    token.cancel();
                    shared.release_heartbeat(&task_id, &token);
                    tracing::info!(task_id = %task_id, timeout_ms = after.as_millis() as u64, "task timed out");
                    shared.deliver(task_id, Outcome::TimedOut(after));
                }
                Reaped::Leaked { task_id, token } => {
                    shared.release_heartbeat(&task_id, &token);
                    shared.deliver(task_id, Outcome::Cancelled);
                }
            }
        }
    }
}

fn scan<T: Send + 'static>(table: &mut Table<T>, shared: &Shared<T>, now: Instant) -> Vec<Reaped> {
    let mut reaped = Vec::new();

    let expired: Vec<(TaskId, CancelToken, Duration)> = table
        .slots
        .values()
        .filter(|slot| slot.record.status == TaskStatus::Running)
        .filter(|slot| slot.record.deadline().is_some_and(|deadline| deadline <= now))
        .map(|slot| (slot.record.id.clone(), slot.token.clone(), slot.record.timeout))
        .collect();
    for (task_id, token, after) in expired {
        if table.finish(&task_id, &token, TaskStatus::TimedOut) {
            reaped.push(Reaped::TimedOut { task_id, token, after });
        }
    }

    let mut leaked = Vec::new();
    for execution in table.executing.values_mut() {
        if !execution.token.is_cancelled() {
            continue;
        }
        let abandoned_at = *execution.abandoned_at.get_or_insert(now);
        if execution.leak_reported || now.duration_since(abandoned_at) < shared.config.leak_grace {
            continue;
        }
        execution.leak_reported = true;
        tracing::warn!(
            task_id = %execution.task_id,
            grace_ms = shared.config.leak_grace.as_millis() as u64,
            "worker leak: payload still running after cancellation"
        );
        leaked.push((execution.task_id.clone(), execution.token.clone()));
    }
    table.leaked += leaked.len();
    for (task_id, token) in leaked {
        if table.finish(&task_id, &token, TaskStatus::Cancelled) {
            reaped.push(Reaped::Leaked { task_id, token });
        }
    }

    reaped
}

/// How long the reaper may sleep. `None`: nothing to watch until woken.
fn next_wake<T>(table: &Table<T>, shared: &Shared<T>, now: Instant) -> Option<Duration> {
    let deadline = table
        .slots
        .values()
        .filter(|slot| slot.record.status == TaskStatus::Running)
        .filter_map(|slot| slot.record.deadline())
        .min()
        .map(|deadline| deadline.saturating_duration_since(now));

    let leak_watch = table
        .executing
        .values()
        .any(|execution| execution.token.is_cancelled() && !execution.leak_reported)
        .then(|| shared.config.reaper_poll.min(shared.config.leak_grace));

    match (deadline, leak_watch) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
