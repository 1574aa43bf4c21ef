//! WorkerLoop - プールスレッドの本体
//!
//! # フロー
//! 1. `work_ready` でキューに id が来るのを待つ
//! 2. テーブルロック下で Pending -> Running、ペイロードを取り出す
//! 3. watchdog に登録（ロック外）
//! 4. `catch_unwind` の下でペイロードを実行
//! 5. 終端遷移を試み、成功したときだけ配送

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::app::context::{CancelToken, TaskContext};
use crate::app::runtime::{Execution, Payload, Shared, StallRoute};
use crate::domain::{Outcome, TaskError, TaskId, panic_message};
use crate::ports::StallSink;

struct Claimed<T> {
    task_id: TaskId,
    token: CancelToken,
    payload: Payload<T>,
    stall_threshold: Option<std::time::Duration>,
    execution: u64,
}

pub(crate) fn worker_loop<T: Send + 'static>(worker_id: usize, shared: Arc<Shared<T>>) {
    tracing::debug!(worker_id, "worker started");
    while let Some(claimed) = next_task(&shared) {
        run_claimed(worker_id, &shared, claimed);
    }
    tracing::debug!(worker_id, "worker stopped");
}

/// Block until a task can be claimed. `None` once the runner is stopping.
fn next_task<T: Send + 'static>(shared: &Shared<T>) -> Option<Claimed<T>> {
    let mut table = shared.lock_table();
    loop {
        if table.stopping {
            return None;
        }
        let Some(task_id) = table.queue.pop_front() else {
            table = shared.work_ready.wait(table).unwrap_or_else(|e| e.into_inner());
            continue;
        };

        let execution = table.next_execution;
        let Some(slot) = table.slots.get_mut(&task_id) else {
            continue;
        };
        // cancelled while queued: its outcome was already delivered
        if !slot.record.start() {
            continue;
        }
        let Some(payload) = slot.payload.take() else {
            continue;
        };
        let token = slot.token.clone();
        let stall_threshold = slot.record.stall_threshold;

        table.next_execution += 1;
        table.executing.insert(
            execution,
            Execution {
                task_id: task_id.clone(),
                token: token.clone(),
                abandoned_at: None,
                leak_reported: false,
            },
        );
        drop(table);
        // a new deadline exists
        shared.reaper_wake.notify_one();

        return Some(Claimed {
            task_id,
            token,
            payload,
            stall_threshold,
            execution,
        });
    }
}

fn run_claimed<T: Send + 'static>(worker_id: usize, shared: &Arc<Shared<T>>, claimed: Claimed<T>) {
    let Claimed {
        task_id,
        token,
        payload,
        stall_threshold,
        execution,
    } = claimed;

    if let (Some(watchdog), Some(threshold)) = (&shared.watchdog, stall_threshold) {
        // a stall cancels through the runner, like an explicit cancel()
        let sink: Arc<dyn StallSink> = Arc::new(StallRoute {
            shared: Arc::downgrade(shared),
            token: token.clone(),
        });
        watchdog.register_with_token(task_id.clone(), threshold, token.clone(), sink);
        // timed out between claim and registration
        if token.is_finished() {
            watchdog.release_token(&task_id, &token);
        }
    }

    tracing::debug!(worker_id, task_id = %task_id, "task running");
    let ctx = TaskContext::new(task_id.clone(), token.clone(), shared.watchdog.clone());
    let result = panic::catch_unwind(AssertUnwindSafe(|| payload(&ctx)));

    // cancellation wins over whatever the payload returned
    let outcome = if token.is_cancelled() {
        Outcome::Cancelled
    } else {
        match result {
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(err)) => match TaskError::from_boxed(err) {
                TaskError::OperationCancelled => Outcome::Cancelled,
                error => Outcome::Failed(error),
            },
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(worker_id, task_id = %task_id, panic = %message, "payload panicked");
                Outcome::Failed(TaskError::Panicked(message))
            }
        }
    };

    let finished = {
        let mut table = shared.lock_table();
        if let Some(done) = table.executing.remove(&execution)
            && done.leak_reported
        {
            table.leaked = table.leaked.saturating_sub(1);
            tracing::info!(worker_id, task_id = %task_id, "leaked worker returned");
        }
        let finished = table.finish(&task_id, &token, outcome.status());
        if table.executing.is_empty() {
            shared.idle.notify_all();
        }
        finished
    };

    shared.release_heartbeat(&task_id, &token);
    if finished {
        shared.deliver(task_id, outcome);
    } else {
        tracing::debug!(worker_id, task_id = %task_id, outcome = ?outcome.kind(), "late result discarded");
    }
}
