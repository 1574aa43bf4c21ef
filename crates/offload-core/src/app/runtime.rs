//! TaskRunner - 固定サイズのスレッドプールと exactly-once な結果配送
//!
//! # フロー
//! 1. `submit` がタスクを Pending として記録し、id をキューに積む
//! 2. プールスレッドが取り出し（Pending -> Running）、watchdog に登録して
//!    `catch_unwind` の下でペイロードを実行
//! 3. reaper スレッドが期限切れのタスクを TimedOut にし、キャンセルを無視する
//!    ペイロードを leak として報告
//! 4. `TaskRecord::finish` に勝った側だけが終端の Delivery を 1 つ送る
//! 5. 所有スレッドが `Deliveries` を drain し、`Finished` を取り出した時点で
//!    タスクを回収
//!
//! タスクテーブルは専用の mutex を持つ。watchdog 呼び出しと配送は必ず
//! ロック解放後に行う。

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::app::context::{CancelToken, TaskContext};
use crate::app::delivery::{self, Deliveries, DeliverySender};
use crate::app::reaper_loop::reaper_loop;
use crate::app::status::RunnerStats;
use crate::app::watchdog::Watchdog;
use crate::app::worker_loop::worker_loop;
use crate::domain::{BoxError, Delivery, Outcome, TaskId, TaskRecord, TaskStatus};
use crate::ports::{Clock, IdGenerator, StallSink};

/// プールスレッドが実行する仕事。必要なものは投入時にすべて受け取る
pub type Payload<T> = Box<dyn FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static>;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("task id {0} is still tracked by the runner")]
    DuplicateId(TaskId),

    #[error("runner is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("pool size must be at least 1")]
    EmptyPool,

    #[error("failed to spawn {thread} thread: {source}")]
    Spawn {
        thread: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// プールスレッド数。コア数ではなくデスクトッププロセス向けの大きさ
    pub pool_size: usize,

    /// キャンセル後、leak したワーカーとして報告されるまでの猶予
    pub leak_grace: Duration,

    /// ペイロード実行中に reaper が眠る時間の上限
    pub reaper_poll: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            leak_grace: Duration::from_secs(30),
            reaper_poll: Duration::from_millis(250),
        }
    }
}

/// 投入ごとの設定
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub id: Option<TaskId>,
    pub class: Option<String>,
    pub timeout: Duration,
    /// `None` なら watchdog の対象外
    pub stall_threshold: Option<Duration>,
}

impl SubmitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            id: None,
            class: None,
            timeout,
            stall_threshold: None,
        }
    }

    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = Some(threshold);
        self
    }
}

pub(crate) struct Slot<T> {
    pub(crate) record: TaskRecord,
    pub(crate) payload: Option<Payload<T>>,
    pub(crate) token: CancelToken,
}

/// A payload currently on a pool thread.
pub(crate) struct Execution {
    pub(crate) task_id: TaskId,
    pub(crate) token: CancelToken,
    /// First time the reaper saw the cancel flag raised.
    pub(crate) abandoned_at: Option<Instant>,
    pub(crate) leak_reported: bool,
}

pub(crate) struct Table<T> {
    pub(crate) queue: VecDeque<TaskId>,
    pub(crate) slots: HashMap<TaskId, Slot<T>>,
    pub(crate) executing: HashMap<u64, Execution>,
    pub(crate) next_execution: u64,
    pub(crate) leaked: usize,
    pub(crate) accepting: bool,
    pub(crate) stopping: bool,
}

impl<T> Table<T> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            slots: HashMap::new(),
            executing: HashMap::new(),
            next_execution: 1,
            leaked: 0,
            accepting: true,
            stopping: false,
        }
    }

    /// `task_id` がまだ `token` のものなら終端遷移する。
    /// トークンの finished ビットはクリティカルセクション内で立てる。
    pub(crate) fn finish(&mut self, task_id: &TaskId, token: &CancelToken, terminal: TaskStatus) -> bool {
        let Some(slot) = self.slots.get_mut(task_id) else {
            return false;
        };
        if !slot.token.same_as(token) || !slot.record.finish(terminal) {
            return false;
        }
        slot.payload = None;
        slot.token.mark_finished();
        true
    }
}

/// State shared by the runner handle, pool threads, the reaper and
/// `Deliveries`.
pub(crate) struct Shared<T> {
    table: Mutex<Table<T>>,
    pub(crate) work_ready: Condvar,
    pub(crate) reaper_wake: Condvar,
    pub(crate) idle: Condvar,
    pub(crate) sender: DeliverySender<T>,
    pub(crate) watchdog: Option<Arc<Watchdog>>,
    pub(crate) config: RunnerConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    observers: Mutex<Vec<Weak<dyn FinishObserver<T>>>>,
}

/// Sees every `Finished` delivery when the owning thread takes it off the
/// queue, whichever `Deliveries` method took it.
pub(crate) trait FinishObserver<T>: Send + Sync {
    fn finished(&self, task_id: &TaskId, outcome: &Outcome<T>);
}

impl<T> Shared<T> {
    pub(crate) fn lock_table(&self) -> MutexGuard<'_, Table<T>> {
        // every critical section leaves the table consistent
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn deliver(&self, task_id: TaskId, outcome: Outcome<T>) {
        tracing::debug!(task_id = %task_id, outcome = ?outcome.kind(), "task finished");
        self.sender.send(Delivery::Finished { task_id, outcome });
    }

    /// Stop intake, raise every token and deliver `Cancelled` for the tasks
    /// still queued. Returns how many queued tasks were cancelled.
    fn stop(&self) -> usize {
        let dequeued = {
            let mut guard = self.lock_table();
            let table = &mut *guard;
            table.accepting = false;
            table.stopping = true;
            let queued: Vec<TaskId> = table.queue.drain(..).collect();
            let mut dequeued = Vec::with_capacity(queued.len());
            for task_id in queued {
                let Some(token) = table.slots.get(&task_id).map(|slot| slot.token.clone()) else {
                    continue;
                };
                token.cancel();
                if table.finish(&task_id, &token, TaskStatus::Cancelled) {
                    dequeued.push(task_id);
                }
            }
            for slot in table.slots.values() {
                if slot.record.status == TaskStatus::Running {
                    slot.token.cancel();
                }
            }
            dequeued
        };
        self.work_ready.notify_all();
        self.reaper_wake.notify_all();

        let count = dequeued.len();
        for task_id in dequeued {
            self.deliver(task_id, Outcome::Cancelled);
        }
        count
    }
}

impl<T: Send + 'static> Shared<T> {
    #[cfg(test)]
    pub(crate) fn for_tests(config: RunnerConfig) -> Self {
        use crate::ports::{SystemClock, UlidGenerator};

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (sender, _rx) = delivery::channel();
        Self {
            table: Mutex::new(Table::new()),
            work_ready: Condvar::new(),
            reaper_wake: Condvar::new(),
            idle: Condvar::new(),
            sender,
            watchdog: None,
            config,
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Remove the watchdog registration owned by `token`.
    pub(crate) fn release_heartbeat(&self, task_id: &TaskId, token: &CancelToken) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.release_token(task_id, token);
        }
    }

    /// The owning thread took the terminal delivery: forget the task.
    pub(crate) fn reclaim(&self, task_id: &TaskId) {
        let mut table = self.lock_table();
        if table
            .slots
            .get(task_id)
            .is_some_and(|slot| slot.record.status.is_terminal())
        {
            table.slots.remove(task_id);
        }
    }

    pub(crate) fn observe(&self, observer: Weak<dyn FinishObserver<T>>) {
        self.observers.lock().unwrap_or_else(|e| e.into_inner()).push(observer);
    }

    /// Called by `Deliveries` for each `Finished` it hands out.
    pub(crate) fn notify_finished(&self, task_id: &TaskId, outcome: &Outcome<T>) {
        let observers: Vec<Arc<dyn FinishObserver<T>>> = {
            let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            observers.retain(|observer| observer.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.finished(task_id, outcome);
        }
    }

    fn cancel(&self, task_id: &TaskId, token: &CancelToken) {
        let dequeued = {
            let mut guard = self.lock_table();
            let table = &mut *guard;
            let Some(slot) = table.slots.get_mut(task_id) else {
                return;
            };
            if !slot.token.same_as(token) {
                return;
            }
            match slot.record.status {
                TaskStatus::Pending => {
                    slot.token.cancel();
                    table.queue.retain(|queued| queued != task_id);
                    table.finish(task_id, token, TaskStatus::Cancelled)
                }
                TaskStatus::Running => {
                    if slot.token.cancel() {
                        tracing::debug!(task_id = %task_id, "cancellation requested");
                    }
                    // the flag may have been raised elsewhere (watchdog); the
                    // leak clock starts on the reaper's next scan
                    self.reaper_wake.notify_one();
                    false
                }
                // terminal: nothing to do
                _ => false,
            }
        };
        if dequeued {
            self.deliver(task_id.clone(), Outcome::Cancelled);
        }
    }
}

/// Cancellation seam for handles, so `TaskHandle` need not be generic.
pub(crate) trait CancelTask: Send + Sync {
    fn cancel_task(&self, task_id: &TaskId, token: &CancelToken);
}

impl<T: Send + 'static> CancelTask for Shared<T> {
    fn cancel_task(&self, task_id: &TaskId, token: &CancelToken) {
        self.cancel(task_id, token);
    }
}

/// Watchdog sink for one running task: queue the `Stalled` notice, then
/// cancel exactly as `TaskHandle::cancel` would.
pub(crate) struct StallRoute<T> {
    pub(crate) shared: Weak<Shared<T>>,
    pub(crate) token: CancelToken,
}

impl<T: Send + 'static> StallSink for StallRoute<T> {
    fn stalled(&self, task_id: &TaskId) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.sender.stalled(task_id);
        shared.cancel(task_id, &self.token);
    }
}

/// TaskHandle は投入したタスクへの呼び出し側の手がかり
///
/// Outcome は `Deliveries` から届き、ハンドルからは届かない。
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    token: CancelToken,
    runner: Weak<dyn CancelTask>,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// # 状態ごとの挙動
    /// - dispatch 前: キューから外し `Cancelled` として配送
    /// - 実行中: フラグを立てる。いつ止まるかはペイロード次第
    /// - 終端後: 何もしない
    pub fn cancel(&self) {
        if let Some(runner) = self.runner.upgrade() {
            runner.cancel_task(&self.id, &self.token);
        }
    }

    /// 終端状態に達したか
    pub fn is_done(&self) -> bool {
        self.token.is_finished()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("done", &self.is_done())
            .finish()
    }
}

/// `shutdown` の結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// 実行されずに `Cancelled` で配送された Pending タスク
    pub cancelled_pending: usize,
    /// 猶予が尽きた時点でまだ動いていたペイロード
    pub abandoned: usize,
}

pub struct TaskRunner<T> {
    shared: Arc<Shared<T>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> TaskRunner<T> {
    /// プールと reaper を起動する。Outcome が戻ってくる経路は返り値の
    /// `Deliveries` だけ。
    pub fn new(
        config: RunnerConfig,
        watchdog: Option<Arc<Watchdog>>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<(Self, Deliveries<T>), RunnerError> {
        if config.pool_size == 0 {
            return Err(RunnerError::EmptyPool);
        }
        let (sender, rx) = delivery::channel();
        let shared = Arc::new(Shared {
            table: Mutex::new(Table::new()),
            work_ready: Condvar::new(),
            reaper_wake: Condvar::new(),
            idle: Condvar::new(),
            sender,
            watchdog,
            config,
            clock,
            ids,
            observers: Mutex::new(Vec::new()),
        });

        let runner = Self {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::new()),
        };
        for worker_id in 0..shared.config.pool_size {
            let pool_shared = Arc::clone(&shared);
            runner.spawn_thread(format!("offload-worker-{worker_id}"), move || {
                worker_loop(worker_id, pool_shared)
            })?;
        }
        let reaper_shared = Arc::clone(&shared);
        runner.spawn_thread("offload-reaper".to_string(), move || reaper_loop(reaper_shared))?;

        tracing::info!(pool_size = shared.config.pool_size, "task runner started");
        Ok((runner, Deliveries::new(rx, shared)))
    }

    fn spawn_thread<F>(&self, name: String, body: F) -> Result<(), RunnerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|source| {
                self.request_shutdown();
                RunnerError::Spawn { thread: name, source }
            })?;
        self.threads.lock().unwrap_or_else(|e| e.into_inner()).push(join);
        Ok(())
    }

    /// Submit with an explicit timeout and an optional caller-chosen id.
    pub fn submit<F>(&self, payload: F, timeout: Duration, id: Option<TaskId>) -> Result<TaskHandle, SubmitError>
    where
        F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
    {
        let mut options = SubmitOptions::new(timeout);
        options.id = id;
        self.submit_with(options, payload)
    }

    pub fn submit_with<F>(&self, options: SubmitOptions, payload: F) -> Result<TaskHandle, SubmitError>
    where
        F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
    {
        let SubmitOptions {
            id,
            class,
            timeout,
            stall_threshold,
        } = options;
        let id = id.unwrap_or_else(|| self.shared.ids.generate_task_id());
        let token = CancelToken::new();

        {
            let mut table = self.shared.lock_table();
            if !table.accepting {
                return Err(SubmitError::ShuttingDown);
            }
            if table.slots.contains_key(&id) {
                return Err(SubmitError::DuplicateId(id));
            }
            let record = TaskRecord::new(id.clone(), class, timeout, stall_threshold, self.shared.clock.now());
            table.slots.insert(
                id.clone(),
                Slot {
                    record,
                    payload: Some(Box::new(payload)),
                    token: token.clone(),
                },
            );
            table.queue.push_back(id.clone());
        }
        self.shared.work_ready.notify_one();
        tracing::debug!(task_id = %id, timeout_ms = timeout.as_millis() as u64, "task submitted");

        let runner: Arc<dyn CancelTask> = self.shared.clone();
        Ok(TaskHandle {
            id,
            token,
            runner: Arc::downgrade(&runner),
        })
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.shared.lock_table().slots.get(task_id).map(|slot| slot.record.status)
    }

    pub fn stats(&self) -> RunnerStats {
        let table = self.shared.lock_table();
        let mut stats = RunnerStats {
            pool_size: self.shared.config.pool_size,
            pending: table.queue.len(),
            executing: table.executing.len(),
            leaked_workers: table.leaked,
            ..RunnerStats::default()
        };
        for slot in table.slots.values() {
            match slot.record.status {
                TaskStatus::Running => stats.running += 1,
                status if status.is_terminal() => stats.awaiting_ack += 1,
                _ => {}
            }
        }
        stats
    }

    /// Stop intake, cancel everything, and let the threads wind down
    /// without waiting for them.
    pub fn request_shutdown(&self) -> usize {
        self.shared.stop()
    }

    pub(crate) fn observe(&self, observer: Weak<dyn FinishObserver<T>>) {
        self.shared.observe(observer);
    }

    /// 段階的な停止
    ///
    /// # フロー
    /// 1. 受付を止め、Pending を `Cancelled` で配送し、実行中のトークンを立てる
    /// 2. 実行中のペイロードが戻るのを最大 `grace` 待つ
    /// 3. それでも動いているものは `Cancelled` で配送し、leak として数え、
    ///    スレッドは切り離す
    /// 4. 終わったスレッドを join
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let cancelled_pending = self.request_shutdown();

        let abandoned: Vec<(TaskId, CancelToken)> = {
            let guard = self.shared.lock_table();
            let (mut guard, _) = self
                .shared
                .idle
                .wait_timeout_while(guard, grace, |table| !table.executing.is_empty())
                .unwrap_or_else(|e| e.into_inner());
            let table = &mut *guard;
            let stuck: Vec<(TaskId, CancelToken)> = table
                .executing
                .values_mut()
                .filter(|execution| !execution.leak_reported)
                .map(|execution| {
                    execution.leak_reported = true;
                    (execution.task_id.clone(), execution.token.clone())
                })
                .collect();
            table.leaked += stuck.len();
            stuck
                .into_iter()
                .filter(|(task_id, token)| {
                    tracing::warn!(task_id = %task_id, "worker leak: payload ignored cancellation at shutdown");
                    table.finish(task_id, token, TaskStatus::Cancelled)
                })
                .collect()
        };
        let abandoned_count = abandoned.len();
        for (task_id, token) in abandoned {
            self.shared.release_heartbeat(&task_id, &token);
            self.shared.deliver(task_id, Outcome::Cancelled);
        }

        let threads: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        // idle threads exit promptly once stopping is set
        let settle_until = Instant::now() + Duration::from_millis(200);
        for join in threads {
            while !join.is_finished() && Instant::now() < settle_until {
                thread::sleep(Duration::from_millis(5));
            }
            if join.is_finished() {
                if join.join().is_err() {
                    tracing::warn!("runner thread panicked");
                }
            } else {
                tracing::warn!(thread = ?join.thread().name(), "runner thread still busy at shutdown, detaching");
            }
        }

        tracing::info!(cancelled_pending, abandoned = abandoned_count, "task runner stopped");
        ShutdownReport {
            cancelled_pending,
            abandoned: abandoned_count,
        }
    }
}

/// Dropped without `shutdown`: same as `request_shutdown`, so queued tasks
/// still get their `Cancelled` delivery.
impl<T> Drop for TaskRunner<T> {
    fn drop(&mut self) {
        if !self.shared.lock_table().stopping {
            self.shared.stop();
        }
    }
}
