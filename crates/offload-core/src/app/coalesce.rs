//! Coalescer - runner の手前の throttle と debounce
//!
//! Throttle: キーごとに `min_interval` あたり 1 回だけ dispatch する。実行中に
//! 来た呼び出しはそのタスクに相乗りし、終了後でも interval 内に来た呼び出しは
//! 同じ Outcome の replay を受け取る。呼び出しごとに別の `Ticket` を持ち、
//! 所有スレッドが `Coalescer::drain` するときにそれぞれ終端コールバックを受ける。
//!
//! グループは `Finished` がキューから取り出された時点で確定する。どの
//! `Deliveries` メソッドで取り出しても同じ。相乗りした Ticket への
//! コールバックは次の `Coalescer::drain` で届く。
//!
//! Debounce: キーが quiet window の間静かになったら、最後のリクエストだけを
//! 実行する。置き換えられたリクエストは表に出ない。
//!
//! Coalescer の mutex を持ったまま runner を呼ぶことはない。

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::app::context::TaskContext;
use crate::app::delivery::{Deliveries, route};
use crate::app::runtime::{FinishObserver, Payload, SubmitError, SubmitOptions, TaskRunner};
use crate::app::ticker::Ticker;
use crate::domain::{BoxError, Delivery, Outcome, TaskId};
use crate::ports::{DeliveryHandler, IdGenerator, dispatch_outcome};

/// throttle グループ内での呼び出し側の席
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// コールバックの宛先 id。呼び出しごとに別
    pub id: TaskId,
    /// グループのために実際に走るタスク
    pub task_id: TaskId,
    /// False for the caller whose request was dispatched.
    pub attached: bool,
}

struct ThrottleGroup<T> {
    task_id: TaskId,
    dispatched_at: Instant,
    min_interval: Duration,
    tickets: Vec<TaskId>,
    outcome: Option<Outcome<T>>,
}

impl<T> ThrottleGroup<T> {
    fn window_open(&self, now: Instant) -> bool {
        now.duration_since(self.dispatched_at) < self.min_interval
    }
}

struct DebounceSlot<T> {
    task_id: TaskId,
    payload: Payload<T>,
    due: Instant,
}

struct State<T> {
    groups: HashMap<String, ThrottleGroup<T>>,
    /// Running throttle task -> key.
    by_task: HashMap<TaskId, String>,
    /// Outcomes owed to callers that arrived after their group finished.
    replays: Vec<(TaskId, Outcome<T>)>,
    debounced: HashMap<String, DebounceSlot<T>>,
}

impl<T> State<T> {
    fn prune(&mut self, now: Instant) {
        self.groups
            .retain(|_, group| group.outcome.is_none() || group.window_open(now));
    }
}

impl<T: Clone> State<T> {
    /// Keep a throttle task's outcome for replays and queue it for the
    /// tickets attached to it. Tasks the coalescer did not dispatch are ignored.
    fn settle(&mut self, task_id: &TaskId, outcome: &Outcome<T>) {
        let Some(key) = self.by_task.remove(task_id) else {
            return;
        };
        let Some(group) = self.groups.get_mut(&key) else {
            return;
        };
        // the dispatching caller's ticket is the task id itself
        let attached: Vec<TaskId> = std::mem::take(&mut group.tickets)
            .into_iter()
            .filter(|ticket| ticket != task_id)
            .collect();
        if group.window_open(Instant::now()) {
            group.outcome = Some(outcome.clone());
        } else {
            self.groups.remove(&key);
        }
        self.replays
            .extend(attached.into_iter().map(|ticket| (ticket, outcome.clone())));
    }
}

fn lock<T>(state: &Mutex<State<T>>) -> MutexGuard<'_, State<T>> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: Clone + Send> FinishObserver<T> for Mutex<State<T>> {
    fn finished(&self, task_id: &TaskId, outcome: &Outcome<T>) {
        lock(self).settle(task_id, outcome);
    }
}

pub struct Coalescer<T> {
    runner: Arc<TaskRunner<T>>,
    ids: Arc<dyn IdGenerator>,
    defaults: SubmitOptions,
    state: Arc<Mutex<State<T>>>,
}

impl<T: Clone + Send + 'static> Coalescer<T> {
    /// `defaults` supplies timeout, class and stall threshold for every task
    /// the coalescer dispatches. Its id is ignored.
    pub fn new(runner: Arc<TaskRunner<T>>, ids: Arc<dyn IdGenerator>, defaults: SubmitOptions) -> Self {
        let state = Arc::new(Mutex::new(State {
            groups: HashMap::new(),
            by_task: HashMap::new(),
            replays: Vec::new(),
            debounced: HashMap::new(),
        }));
        let observer: Weak<dyn FinishObserver<T>> = Arc::downgrade(&state) as Weak<Mutex<State<T>>>;
        runner.observe(observer);
        Self {
            runner,
            ids,
            defaults: SubmitOptions { id: None, ..defaults },
            state,
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        lock(&self.state)
    }

    pub fn runner(&self) -> &Arc<TaskRunner<T>> {
        &self.runner
    }

    /// `key` のタスクが `min_interval` 内に走ったか実行中なら、その Outcome を
    /// 共有する。そうでなければ `payload` を実行する。
    pub fn submit_throttled<F>(&self, key: &str, payload: F, min_interval: Duration) -> Result<Ticket, SubmitError>
    where
        F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
    {
        self.submit_throttled_with(key, self.defaults.clone(), payload, min_interval)
    }

    /// `submit_throttled` with explicit timeout, class and stall threshold
    /// for the dispatched task. `options.id` is ignored.
    pub fn submit_throttled_with<F>(
        &self,
        key: &str,
        options: SubmitOptions,
        payload: F,
        min_interval: Duration,
    ) -> Result<Ticket, SubmitError>
    where
        F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
    {
        let task_id = {
            let mut guard = self.state();
            let state = &mut *guard;
            let now = Instant::now();
            state.prune(now);

            if let Some(group) = state.groups.get_mut(key) {
                let ticket = Ticket {
                    id: self.ids.generate_task_id(),
                    task_id: group.task_id.clone(),
                    attached: true,
                };
                match group.outcome.clone() {
                    None => {
                        group.tickets.push(ticket.id.clone());
                        tracing::debug!(key, task_id = %group.task_id, ticket = %ticket.id, "attached to in-flight task");
                    }
                    Some(outcome) => {
                        tracing::debug!(key, task_id = %group.task_id, ticket = %ticket.id, "replaying recent outcome");
                        state.replays.push((ticket.id.clone(), outcome));
                    }
                }
                return Ok(ticket);
            }

            // reserve the key before leaving the lock so concurrent callers attach
            let task_id = self.ids.generate_task_id();
            state.groups.insert(
                key.to_string(),
                ThrottleGroup {
                    task_id: task_id.clone(),
                    dispatched_at: now,
                    min_interval,
                    tickets: vec![task_id.clone()],
                    outcome: None,
                },
            );
            state.by_task.insert(task_id.clone(), key.to_string());
            task_id
        };

        let options = SubmitOptions {
            id: Some(task_id.clone()),
            ..options
        };
        match self.runner.submit_with(options, payload) {
            Ok(_) => {
                tracing::debug!(key, task_id = %task_id, "throttled task dispatched");
                Ok(Ticket {
                    id: task_id.clone(),
                    task_id,
                    attached: false,
                })
            }
            Err(err) => {
                // callers that attached meanwhile must still hear back
                let mut state = self.state();
                state.by_task.remove(&task_id);
                if let Some(group) = state.groups.remove(key) {
                    let orphans: Vec<TaskId> = group.tickets.into_iter().filter(|id| *id != task_id).collect();
                    state
                        .replays
                        .extend(orphans.into_iter().map(|ticket| (ticket, Outcome::Cancelled)));
                }
                Err(err)
            }
        }
    }

    /// quiet window を待っている `key` のリクエストを `payload` で置き換える。
    /// このリクエストが生き残ったときにタスクが持つ id を返す。
    pub fn submit_debounced<F>(&self, key: &str, payload: F, quiet: Duration) -> TaskId
    where
        F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
    {
        let task_id = self.ids.generate_task_id();
        let slot = DebounceSlot {
            task_id: task_id.clone(),
            payload: Box::new(payload),
            due: Instant::now() + quiet,
        };
        if let Some(superseded) = self.state().debounced.insert(key.to_string(), slot) {
            tracing::debug!(key, superseded = %superseded.task_id, task_id = %task_id, "debounced request replaced");
        }
        task_id
    }

    /// Dispatch every debounced request whose quiet window has passed.
    /// Returns how many were submitted.
    pub fn flush_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<DebounceSlot<T>> = {
            let mut state = self.state();
            let keys: Vec<String> = state
                .debounced
                .iter()
                .filter(|(_, slot)| slot.due <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| state.debounced.remove(key)).collect()
        };

        let mut submitted = 0;
        for slot in due {
            let options = SubmitOptions {
                id: Some(slot.task_id.clone()),
                ..self.defaults.clone()
            };
            match self.runner.submit_with(options, slot.payload) {
                Ok(_) => submitted += 1,
                Err(err) => tracing::warn!(task_id = %slot.task_id, error = %err, "debounced task not dispatched"),
            }
        }
        submitted
    }

    /// Is anything pending or running for `key`?
    pub fn in_flight(&self, key: &str) -> bool {
        let state = self.state();
        state.groups.get(key).is_some_and(|group| group.outcome.is_none()) || state.debounced.contains_key(key)
    }

    /// 所有スレッドの 1 tick
    ///
    /// キューの Delivery を振り分け、throttle の Outcome はすべての Ticket に
    /// 配る。呼んだコールバックの数を返す。
    pub fn drain<H>(&self, deliveries: &mut Deliveries<T>, handler: &mut H) -> usize
    where
        H: DeliveryHandler<T> + ?Sized,
    {
        let mut callbacks = 0;
        while let Some(delivery) = deliveries.try_next() {
            match delivery {
                Delivery::Stalled { task_id } => {
                    let tickets = self.tickets_of(&task_id);
                    if tickets.is_empty() {
                        handler.on_stalled(&task_id);
                        callbacks += 1;
                    } else {
                        for ticket in &tickets {
                            handler.on_stalled(ticket);
                        }
                        callbacks += tickets.len();
                    }
                }
                // already settled by `try_next`; attached tickets are replays now
                finished => {
                    route(handler, finished);
                    callbacks += 1;
                }
            }
        }

        let replays = std::mem::take(&mut self.state().replays);
        callbacks += replays.len();
        for (ticket, outcome) in replays {
            dispatch_outcome(handler, &ticket, outcome);
        }
        callbacks
    }

    fn tickets_of(&self, task_id: &TaskId) -> Vec<TaskId> {
        let state = self.state();
        state
            .by_task
            .get(task_id)
            .and_then(|key| state.groups.get(key))
            .map(|group| group.tickets.clone())
            .unwrap_or_default()
    }

    /// Flush due debounce windows every `tick` on a background thread.
    pub fn start(self: &Arc<Self>, tick: Duration) -> io::Result<CoalescerHandle> {
        let coalescer: Weak<Self> = Arc::downgrade(self);
        let ticker = Ticker::spawn(
            "offload-debounce",
            tick,
            move || {
                if let Some(coalescer) = coalescer.upgrade() {
                    coalescer.flush_due();
                }
            },
            || tracing::debug!("debounce flusher stopped"),
        )?;
        Ok(CoalescerHandle { ticker })
    }
}

pub struct CoalescerHandle {
    ticker: Ticker,
}

impl CoalescerHandle {
    pub fn shutdown_and_join(self) {
        self.ticker.shutdown_and_join();
    }
}
