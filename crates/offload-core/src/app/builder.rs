//! ServicesBuilder - runner、watchdog、キャッシュ、coalescer の配線
//!
//! プロセスにつき 1 つの `Services` を起動時に作り、参照で渡す。`build()` は
//! まず設定を検証し、バックグラウンドスレッドを空回りさせる値や、すべてを
//! 即座に失効させる値を拒否する。

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::coalesce::{Coalescer, CoalescerHandle, Ticket};
use crate::app::context::TaskContext;
use crate::app::delivery::Deliveries;
use crate::app::runtime::{RunnerConfig, RunnerError, ShutdownReport, SubmitError, SubmitOptions, TaskHandle, TaskRunner};
use crate::app::status::RunnerStats;
use crate::app::watchdog::{Watchdog, WatchdogHandle};
use crate::cache::{CachePolicy, KeyPart, MaintenanceHandle, ResultCache, make_key};
use crate::config::RuntimeConfig;
use crate::domain::BoxError;
use crate::ports::{Clock, DeliveryHandler, IdGenerator, SystemClock, UlidGenerator};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("pool_size must be at least 1")]
    ZeroPoolSize,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("task class {class}: timeout must be greater than zero")]
    ZeroTimeout { class: String },

    #[error("task class {class}: stall threshold must be greater than zero")]
    ZeroStallThreshold { class: String },

    #[error("cache namespace {namespace}: ttl must be greater than zero")]
    ZeroTtl { namespace: String },

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("failed to start background thread: {0}")]
    Spawn(#[from] io::Error),
}

pub struct ServicesBuilder {
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    debounce_tick: Duration,
}

impl ServicesBuilder {
    pub fn from_config(config: RuntimeConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            debounce_tick: Duration::from_millis(50),
        }
    }

    /// Replace the wall clock (tests use `ManualClock`).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How often due debounce windows are flushed.
    pub fn debounce_tick(mut self, tick: Duration) -> Self {
        self.debounce_tick = tick;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        let cfg = &self.config;
        if cfg.pool_size == 0 {
            return Err(BuildError::ZeroPoolSize);
        }
        if cfg.watchdog_interval_ms == 0 {
            return Err(BuildError::ZeroInterval("watchdog_interval_ms"));
        }
        if cfg.cache.sweep_interval_secs == 0 {
            return Err(BuildError::ZeroInterval("cache.sweep_interval_secs"));
        }
        if cfg.cache.persistence.enabled && cfg.cache.persistence.flush_interval_secs == 0 {
            return Err(BuildError::ZeroInterval("cache.persistence.flush_interval_secs"));
        }
        if self.debounce_tick.is_zero() {
            return Err(BuildError::ZeroInterval("debounce_tick"));
        }

        let classes = std::iter::once(("default", &cfg.default_class))
            .chain(cfg.task_classes.iter().map(|(name, class)| (name.as_str(), class)));
        for (name, class) in classes {
            if class.timeout_ms == 0 {
                return Err(BuildError::ZeroTimeout { class: name.to_string() });
            }
            if class.stall_threshold_ms == 0 {
                return Err(BuildError::ZeroStallThreshold { class: name.to_string() });
            }
        }

        if cfg.cache.default_ttl_secs == 0 {
            return Err(BuildError::ZeroTtl {
                namespace: "default".to_string(),
            });
        }
        if let Some((namespace, _)) = cfg.cache.namespaces.iter().find(|(_, ttl)| **ttl == 0) {
            return Err(BuildError::ZeroTtl {
                namespace: namespace.clone(),
            });
        }
        Ok(())
    }

    /// すべてを起動する。返る `Deliveries` は所有スレッドのもので、
    /// `Services::drain` で drain する。
    pub fn build<T>(self) -> Result<(Services<T>, Deliveries<T>), BuildError>
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        self.validate()?;
        let cfg = self.config;
        let clock = self.clock;
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));

        let watchdog = Arc::new(Watchdog::new(Arc::clone(&clock)));
        let watchdog_handle = watchdog.start(cfg.watchdog_interval())?;

        let runner_config = RunnerConfig {
            pool_size: cfg.pool_size,
            leak_grace: cfg.leak_grace(),
            ..RunnerConfig::default()
        };
        let (runner, deliveries) =
            TaskRunner::new(runner_config, Some(Arc::clone(&watchdog)), Arc::clone(&clock), Arc::clone(&ids))?;
        let runner = Arc::new(runner);

        let persistence = &cfg.cache.persistence;
        let cache = Arc::new(if persistence.enabled {
            ResultCache::with_persistence(Arc::clone(&clock), persistence.path.clone())
        } else {
            ResultCache::new(Arc::clone(&clock))
        });
        let maintenance = cache.start_maintenance(cfg.cache.sweep_interval(), persistence.flush_interval())?;

        let defaults = SubmitOptions::new(cfg.default_class.timeout()).stall_threshold(cfg.default_class.stall_threshold());
        let coalescer = Arc::new(Coalescer::new(Arc::clone(&runner), ids, defaults));
        let coalescer_handle = coalescer.start(self.debounce_tick)?;

        tracing::info!(
            pool_size = cfg.pool_size,
            classes = cfg.task_classes.len(),
            persistent_cache = cache.is_persistent(),
            "services started"
        );

        let services = Services {
            policy: CachePolicy::from_config(&cfg.cache),
            config: cfg,
            runner,
            watchdog,
            cache,
            coalescer,
            background: Mutex::new(Some(Background {
                watchdog: watchdog_handle,
                maintenance,
                coalescer: coalescer_handle,
            })),
        };
        Ok((services, deliveries))
    }
}

struct Background {
    watchdog: WatchdogHandle,
    maintenance: MaintenanceHandle,
    coalescer: CoalescerHandle,
}

/// Result of `lookup_or_submit`.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    /// Fresh cached value; nothing was submitted.
    Hit(T),
    /// Computation running (or joined); the outcome arrives for this ticket.
    Pending(Ticket),
}

pub struct Services<T> {
    config: RuntimeConfig,
    policy: CachePolicy,
    runner: Arc<TaskRunner<T>>,
    watchdog: Arc<Watchdog>,
    cache: Arc<ResultCache<T>>,
    coalescer: Arc<Coalescer<T>>,
    background: Mutex<Option<Background>>,
}

impl<T> Services<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn runner(&self) -> &Arc<TaskRunner<T>> {
        &self.runner
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn cache(&self) -> &Arc<ResultCache<T>> {
        &self.cache
    }

    pub fn coalescer(&self) -> &Arc<Coalescer<T>> {
        &self.coalescer
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn stats(&self) -> RunnerStats {
        self.runner.stats()
    }

    /// Submit options for `class` (default class when not configured).
    pub fn class_options(&self, class: &str) -> SubmitOptions {
        let settings = self.config.class(class);
        SubmitOptions::new(settings.timeout())
            .class(class)
            .stall_threshold(settings.stall_threshold())
    }

    /// Submit with the class's timeout and stall threshold.
    pub fn submit_class<F>(&self, class: &str, payload: F) -> Result<TaskHandle, SubmitError>
    where
        F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
    {
        self.runner.submit_with(self.class_options(class), payload)
    }

    /// キャッシュを先に引く
    ///
    /// # フロー
    /// 1. ヒットしたら `Lookup::Hit`
    /// 2. ミスなら throttle 付きの coalescer で計算する。同じキーの同時ミスは
    ///    1 回の計算を共有する
    /// 3. 成功した結果は配送前にキャッシュへ書く
    ///
    /// `namespace` で TTL とタスククラスが決まる。
    pub fn lookup_or_submit<F>(&self, namespace: &str, key: &str, payload: F) -> Result<Lookup<T>, SubmitError>
    where
        F: FnOnce(&TaskContext) -> Result<T, BoxError> + Send + 'static,
    {
        let cache_key = make_key(&[KeyPart::Str(namespace), KeyPart::Str(key)]);
        if let Some(value) = self.cache.get(&cache_key) {
            tracing::debug!(key = %cache_key, "cache hit");
            return Ok(Lookup::Hit(value));
        }

        let cache = Arc::clone(&self.cache);
        let ttl = self.policy.ttl_for(namespace);
        let store_key = cache_key.clone();
        let compute = move |ctx: &TaskContext| -> Result<T, BoxError> {
            let value = payload(ctx)?;
            if let Err(err) = cache.set(store_key, value.clone(), ttl) {
                tracing::warn!(error = %err, "result not cached");
            }
            Ok(value)
        };
        // zero interval: join while in flight, afterwards the cache answers
        let ticket = self
            .coalescer
            .submit_throttled_with(&cache_key, self.class_options(namespace), compute, Duration::ZERO)?;
        Ok(Lookup::Pending(ticket))
    }

    /// Owning-thread tick. Returns the number of callbacks made.
    pub fn drain<H>(&self, deliveries: &mut Deliveries<T>, handler: &mut H) -> usize
    where
        H: DeliveryHandler<T> + ?Sized,
    {
        self.coalescer.drain(deliveries, handler)
    }

    /// debounce の flusher、runner（最大 `grace` 待つ）、watchdog、キャッシュの
    /// メンテナンス（最後にもう一度 flush）の順に止める。
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let background = self.background.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(Background {
            watchdog,
            maintenance,
            coalescer,
        }) = background
        else {
            return self.runner.shutdown(grace);
        };

        coalescer.shutdown_and_join();
        let report = self.runner.shutdown(grace);
        watchdog.shutdown_and_join();
        maintenance.shutdown_and_join();
        tracing::info!(
            cancelled_pending = report.cancelled_pending,
            abandoned = report.abandoned,
            "services stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use rstest::rstest;

    use crate::config::TaskClassConfig;
    use crate::domain::{TaskError, TaskId};

    #[derive(Default)]
    struct Recorder {
        results: Vec<(TaskId, String)>,
        errors: Vec<(TaskId, TaskError)>,
        cancelled: Vec<TaskId>,
        stalled: Vec<TaskId>,
    }

    impl DeliveryHandler<String> for Recorder {
        fn on_result(&mut self, task_id: &TaskId, value: String) {
            self.results.push((task_id.clone(), value));
        }

        fn on_error(&mut self, task_id: &TaskId, error: TaskError) {
            self.errors.push((task_id.clone(), error));
        }

        fn on_cancelled(&mut self, task_id: &TaskId) {
            self.cancelled.push(task_id.clone());
        }

        fn on_stalled(&mut self, task_id: &TaskId) {
            self.stalled.push(task_id.clone());
        }
    }

    fn config() -> RuntimeConfig {
        let mut cfg = RuntimeConfig {
            pool_size: 2,
            watchdog_interval_ms: 20,
            leak_grace_ms: 1_000,
            ..RuntimeConfig::default()
        };
        cfg.task_classes.insert(
            "quick".to_string(),
            TaskClassConfig {
                timeout_ms: 40,
                stall_threshold_ms: 10_000,
            },
        );
        cfg.cache.namespaces.insert("vt".to_string(), 3_600);
        cfg
    }

    async fn drain_until(
        services: &Services<String>,
        deliveries: &mut Deliveries<String>,
        recorder: &mut Recorder,
        done: impl Fn(&Recorder) -> bool,
    ) {
        let wait = async {
            loop {
                services.drain(deliveries, recorder);
                if done(recorder) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("deliveries did not arrive in time");
    }

    #[rstest]
    #[case::pool(|c: &mut RuntimeConfig| c.pool_size = 0)]
    #[case::watchdog(|c: &mut RuntimeConfig| c.watchdog_interval_ms = 0)]
    #[case::sweep(|c: &mut RuntimeConfig| c.cache.sweep_interval_secs = 0)]
    #[case::timeout(|c: &mut RuntimeConfig| c.default_class.timeout_ms = 0)]
    #[case::stall(|c: &mut RuntimeConfig| c.task_classes.get_mut("quick").unwrap().stall_threshold_ms = 0)]
    #[case::default_ttl(|c: &mut RuntimeConfig| c.cache.default_ttl_secs = 0)]
    #[case::namespace_ttl(|c: &mut RuntimeConfig| { c.cache.namespaces.insert("gpu".into(), 0); })]
    fn invalid_config_fails_fast(#[case] break_it: fn(&mut RuntimeConfig)) {
        let mut cfg = config();
        break_it(&mut cfg);
        assert!(ServicesBuilder::from_config(cfg).build::<String>().is_err());
    }

    #[test]
    fn zero_stall_threshold_names_the_class() {
        let mut cfg = config();
        cfg.task_classes.get_mut("quick").unwrap().stall_threshold_ms = 0;
        match ServicesBuilder::from_config(cfg).build::<String>() {
            Err(BuildError::ZeroStallThreshold { class }) => assert_eq!(class, "quick"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("config must be rejected"),
        }
    }

    #[tokio::test]
    async fn class_timeout_is_applied() {
        let (services, mut deliveries) = ServicesBuilder::from_config(config()).build::<String>().unwrap();
        let handle = services
            .submit_class("quick", |ctx| {
                while !ctx.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok("late".to_string())
            })
            .unwrap();

        let mut recorder = Recorder::default();
        drain_until(&services, &mut deliveries, &mut recorder, |r| !r.errors.is_empty()).await;
        assert!(matches!(
            recorder.errors.as_slice(),
            [(id, TaskError::OperationTimedOut(after))] if id == handle.id() && *after == Duration::from_millis(40)
        ));
        services.shutdown(Duration::from_secs(1));
    }

    #[tokio::test]
    async fn lookup_computes_once_then_hits_the_cache() {
        let (services, mut deliveries) = ServicesBuilder::from_config(config()).build::<String>().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let lookup = |calls: &Arc<AtomicUsize>| {
            let calls = Arc::clone(calls);
            services
                .lookup_or_submit("vt", "sha256:abc", move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(30));
                    Ok("clean".to_string())
                })
                .unwrap()
        };

        let first = lookup(&calls);
        let second = lookup(&calls);
        let (Lookup::Pending(first), Lookup::Pending(second)) = (first, second) else {
            panic!("cold cache must not hit");
        };
        assert_eq!(first.task_id, second.task_id);
        assert_ne!(first.id, second.id);

        let mut recorder = Recorder::default();
        drain_until(&services, &mut deliveries, &mut recorder, |r| r.results.len() == 2).await;
        assert!(recorder.results.iter().all(|(_, v)| v == "clean"));

        assert_eq!(lookup(&calls), Lookup::Hit("clean".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entry = services.cache().get_entry("vt:sha256\\:abc").unwrap();
        assert_eq!(entry.ttl, Duration::from_secs(3_600));
        services.shutdown(Duration::from_secs(1));
    }

    #[tokio::test]
    async fn failed_lookup_is_not_cached() {
        let (services, mut deliveries) = ServicesBuilder::from_config(config()).build::<String>().unwrap();
        services
            .lookup_or_submit("whois", "example.org", |_| Err("registry unreachable".into()))
            .unwrap();

        let mut recorder = Recorder::default();
        drain_until(&services, &mut deliveries, &mut recorder, |r| !r.errors.is_empty()).await;
        assert!(services.cache().is_empty());
        services.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn shutdown_rejects_new_work_and_is_repeatable() {
        let (services, _deliveries) = ServicesBuilder::from_config(config()).build::<String>().unwrap();
        let start = Instant::now();
        services.shutdown(Duration::from_secs(1));
        services.shutdown(Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(5));

        let rejected = services.submit_class("quick", |_| Ok(String::new()));
        assert!(matches!(rejected, Err(SubmitError::ShuttingDown)));
    }
}
