//! Watchdog - heartbeat の登録簿と stall 検出
//!
//! # フロー
//! 1. runner がタスク開始時にキャンセルトークンと一緒に登録
//! 2. ペイロードが `TaskContext::heartbeat()` を呼ぶと `last_seen_at` を更新
//! 3. 定期的な sweep が閾値より長く沈黙している登録を見つけ、一度だけ
//!    `Stalled` を報告してキャンセル
//! 4. 終端遷移のときに登録を外す
//!
//! 登録簿の mutex を持つのは O(1) のマップ更新と、stall 候補を集める走査の間
//! だけ。キャンセルと通知はロック解放後。

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::app::context::CancelToken;
use crate::app::ticker::Ticker;
use crate::domain::TaskId;
use crate::ports::{Clock, NoopStallSink, StallSink, elapsed_between};

/// 実行中タスクの生存記録
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub task_id: TaskId,
    pub last_seen_at: DateTime<Utc>,
}

/// 登録 1 回分の識別子
///
/// 終わったタスクからの遅れた `release` が、同じ id を再利用した新しい登録を
/// 消さないようにする。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

struct Registration {
    serial: RegistrationId,
    record: HeartbeatRecord,
    stall_threshold: Duration,
    notified: bool,
    cancel: Option<CancelToken>,
    sink: Option<Arc<dyn StallSink>>,
}

pub struct Watchdog {
    registry: Mutex<HashMap<TaskId, Registration>>,
    clock: Arc<dyn Clock>,
    default_sink: Arc<dyn StallSink>,
    next_serial: AtomicU64,
}

impl Watchdog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_sink(clock, Arc::new(NoopStallSink))
    }

    /// `sink` receives stalls of registrations that did not bring their own.
    pub fn with_sink(clock: Arc<dyn Clock>, sink: Arc<dyn StallSink>) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            clock,
            default_sink: sink,
            next_serial: AtomicU64::new(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<TaskId, Registration>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Watch `task_id`; a stall is reported but nothing is cancelled.
    pub fn register(&self, task_id: TaskId, stall_threshold: Duration) -> RegistrationId {
        self.insert(task_id, stall_threshold, None, None)
    }

    /// Watch `task_id`; a stall raises `cancel` and reports through `sink`.
    pub fn register_with_token(
        &self,
        task_id: TaskId,
        stall_threshold: Duration,
        cancel: CancelToken,
        sink: Arc<dyn StallSink>,
    ) -> RegistrationId {
        self.insert(task_id, stall_threshold, Some(cancel), Some(sink))
    }

    fn insert(
        &self,
        task_id: TaskId,
        stall_threshold: Duration,
        cancel: Option<CancelToken>,
        sink: Option<Arc<dyn StallSink>>,
    ) -> RegistrationId {
        let serial = RegistrationId(self.next_serial.fetch_add(1, Ordering::Relaxed));
        let registration = Registration {
            serial,
            record: HeartbeatRecord {
                task_id: task_id.clone(),
                last_seen_at: self.clock.now(),
            },
            stall_threshold,
            notified: false,
            cancel,
            sink,
        };
        self.registry().insert(task_id, registration);
        serial
    }

    /// `last_seen_at` を更新。未登録なら false
    pub fn heartbeat(&self, task_id: &TaskId) -> bool {
        let now = self.clock.now();
        match self.registry().get_mut(task_id) {
            Some(registration) => {
                registration.record.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// Forget `task_id` whatever registration it has. Clears the notified flag.
    pub fn unregister(&self, task_id: &TaskId) -> bool {
        self.registry().remove(task_id).is_some()
    }

    /// Forget `task_id` only if it is still the registration `serial`.
    pub fn release(&self, task_id: &TaskId, serial: RegistrationId) -> bool {
        let mut registry = self.registry();
        if registry.get(task_id).is_some_and(|r| r.serial == serial) {
            registry.remove(task_id);
            true
        } else {
            false
        }
    }

    /// Forget `task_id` only if it was registered with `cancel`.
    pub fn release_token(&self, task_id: &TaskId, cancel: &CancelToken) -> bool {
        let mut registry = self.registry();
        let owned = registry
            .get(task_id)
            .and_then(|r| r.cancel.as_ref())
            .is_some_and(|token| token.same_as(cancel));
        if owned {
            registry.remove(task_id);
        }
        owned
    }

    pub fn is_registered(&self, task_id: &TaskId) -> bool {
        self.registry().contains_key(task_id)
    }

    pub fn record(&self, task_id: &TaskId) -> Option<HeartbeatRecord> {
        self.registry().get(task_id).map(|r| r.record.clone())
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }

    /// 1 回分の sweep。今回 stall として報告したタスクを返す
    pub fn sweep(&self) -> Vec<TaskId> {
        let now = self.clock.now();

        let candidates: Vec<(TaskId, RegistrationId, Option<CancelToken>, Option<Arc<dyn StallSink>>)> = {
            let mut registry = self.registry();
            registry
                .values_mut()
                .filter(|r| !r.notified && elapsed_between(r.record.last_seen_at, now) > r.stall_threshold)
                .map(|r| {
                    r.notified = true;
                    (r.record.task_id.clone(), r.serial, r.cancel.clone(), r.sink.clone())
                })
                .collect()
        };

        let mut stalled = Vec::with_capacity(candidates.len());
        for (task_id, serial, cancel, sink) in candidates {
            // the task may have finished since the scan
            if !self.is_current(&task_id, serial) {
                continue;
            }
            if let Some(cancel) = &cancel {
                if cancel.is_finished() {
                    continue;
                }
                cancel.cancel();
            }
            tracing::info!(task_id = %task_id, "task stalled, cancelling");
            sink.as_ref().unwrap_or(&self.default_sink).stalled(&task_id);
            stalled.push(task_id);
        }
        stalled
    }

    fn is_current(&self, task_id: &TaskId, serial: RegistrationId) -> bool {
        self.registry().get(task_id).is_some_and(|r| r.serial == serial)
    }

    /// バックグラウンドスレッドで `interval` ごとに sweep
    pub fn start(self: &Arc<Self>, interval: Duration) -> io::Result<WatchdogHandle> {
        let watchdog = Arc::clone(self);
        let ticker = Ticker::spawn(
            "offload-watchdog",
            interval,
            move || {
                watchdog.sweep();
            },
            || tracing::debug!("watchdog sweeper stopped"),
        )?;
        tracing::debug!(interval_ms = interval.as_millis() as u64, "watchdog sweeper started");
        Ok(WatchdogHandle { ticker })
    }
}

/// 動作中の sweeper。drop すると sweep が止まる
pub struct WatchdogHandle {
    ticker: Ticker,
}

impl WatchdogHandle {
    pub fn shutdown_and_join(self) {
        self.ticker.shutdown_and_join();
    }
}
