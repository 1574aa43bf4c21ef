mod logger;

use std::collections::HashSet;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior, interval};

use logger::{LoggerConfig, LoggerError, logger_init};
use offload_core::config::TaskClassConfig;
use offload_core::{
    BoxError, BuildError, ConfigError, Deliveries, DeliveryHandler, Lookup, RuntimeConfig, Services,
    ServicesBuilder, SubmitError, TaskContext, TaskError, TaskId, run_process,
};

const TICK: Duration = Duration::from_millis(50);
const DEMO_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Logger(#[from] LoggerError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Prints callbacks and tracks which ids still owe a terminal one.
#[derive(Default)]
struct Printer {
    waiting: HashSet<TaskId>,
}

impl Printer {
    fn track(&mut self, id: TaskId) {
        self.waiting.insert(id);
    }

    fn done(&mut self, task_id: &TaskId) {
        self.waiting.remove(task_id);
    }
}

impl DeliveryHandler<String> for Printer {
    fn on_result(&mut self, task_id: &TaskId, value: String) {
        println!("[{task_id}] result: {value}");
        self.done(task_id);
    }

    fn on_error(&mut self, task_id: &TaskId, error: TaskError) {
        println!("[{task_id}] error: {error}");
        self.done(task_id);
    }

    fn on_cancelled(&mut self, task_id: &TaskId) {
        println!("[{task_id}] cancelled");
        self.done(task_id);
    }

    fn on_stalled(&mut self, task_id: &TaskId) {
        println!("[{task_id}] stalled: no heartbeat within the class threshold");
    }
}

fn load_config() -> Result<RuntimeConfig, ConfigError> {
    match std::env::args_os().nth(1) {
        Some(path) => RuntimeConfig::from_path(path),
        None => {
            let mut config = RuntimeConfig::default();
            config.watchdog_interval_ms = 200;
            config.task_classes.insert(
                "wedged".to_string(),
                TaskClassConfig {
                    timeout_ms: 3_000,
                    stall_threshold_ms: 500,
                },
            );
            Ok(config)
        }
    }
}

fn probe(host: &'static str) -> impl FnOnce(&TaskContext) -> Result<String, BoxError> + Send + 'static {
    move |ctx: &TaskContext| {
        for _ in 0..4 {
            ctx.checkpoint()?;
            ctx.heartbeat();
            thread::sleep(Duration::from_millis(100));
        }
        Ok(format!("{host} reachable"))
    }
}

fn reputation(hash: &'static str) -> impl FnOnce(&TaskContext) -> Result<String, BoxError> + Send + 'static {
    move |ctx: &TaskContext| {
        ctx.heartbeat();
        thread::sleep(Duration::from_millis(300));
        ctx.checkpoint()?;
        Ok(format!("{hash}: 0/72 engines flagged"))
    }
}

fn submit_demo(services: &Services<String>, printer: &mut Printer) -> Result<(), CliError> {
    let handle = services.submit_class("probe", probe("10.0.0.1"))?;
    printer.track(handle.id().clone());

    match services.lookup_or_submit("vt", "sha256:9f86d081", reputation("sha256:9f86d081"))? {
        Lookup::Hit(value) => println!("cache hit: {value}"),
        Lookup::Pending(ticket) => printer.track(ticket.id),
    }

    let polls = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let polls = Arc::clone(&polls);
        let ticket = services.coalescer().submit_throttled(
            "gpu-poll",
            move |_ctx: &TaskContext| {
                let n = polls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("gpu 41C, 12% load (poll #{n})"))
            },
            Duration::from_millis(1_000),
        )?;
        printer.track(ticket.id);
    }

    for term in ["proc", "proce", "process"] {
        let id = services.coalescer().submit_debounced(
            "search",
            move |_ctx: &TaskContext| Ok(format!("search results for {term:?}")),
            Duration::from_millis(150),
        );
        if term == "process" {
            printer.track(id);
        }
    }

    let handle = services.submit_class("logs", |ctx: &TaskContext| {
        let mut command = Command::new("uname");
        command.arg("-a");
        let output = run_process(ctx, command, Duration::from_millis(20))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    })?;
    printer.track(handle.id().clone());

    // never heartbeats after starting: the watchdog reports it and the
    // class timeout ends it
    let handle = services.submit_class("wedged", |ctx: &TaskContext| {
        ctx.heartbeat();
        while !ctx.is_cancelled() {
            thread::sleep(Duration::from_millis(25));
        }
        Err(TaskError::OperationCancelled.into())
    })?;
    printer.track(handle.id().clone());

    let handle = services.submit_class("probe", probe("10.0.0.2"))?;
    handle.cancel();
    printer.track(handle.id().clone());

    Ok(())
}

async fn owning_loop(services: &Services<String>, deliveries: &mut Deliveries<String>, printer: &mut Printer) {
    let deadline = Instant::now() + DEMO_DEADLINE;
    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !printer.waiting.is_empty() && Instant::now() < deadline {
        ticker.tick().await;
        services.drain(deliveries, printer);
    }
    if !printer.waiting.is_empty() {
        tracing::warn!(outstanding = printer.waiting.len(), "demo deadline reached");
    }
}

async fn run() -> Result<(), CliError> {
    let config = load_config()?;
    logger_init(&LoggerConfig::from_env()?)?;
    tracing::info!(pool_size = config.pool_size, "starting offload demo");

    let grace = config.shutdown_grace();
    let (services, mut deliveries) = ServicesBuilder::from_config(config).build::<String>()?;
    let mut printer = Printer::default();

    let submitted = submit_demo(&services, &mut printer);
    if submitted.is_ok() {
        owning_loop(&services, &mut deliveries, &mut printer).await;

        match services.lookup_or_submit("vt", "sha256:9f86d081", reputation("sha256:9f86d081")) {
            Ok(Lookup::Hit(value)) => println!("second lookup served from cache: {value}"),
            Ok(Lookup::Pending(ticket)) => println!("second lookup recomputing as {}", ticket.id),
            Err(err) => tracing::warn!(error = %err, "second lookup rejected"),
        }
        match serde_json::to_string(&services.stats()) {
            Ok(stats) => println!("stats: {stats}"),
            Err(err) => tracing::warn!(error = %err, "stats not printable"),
        }
    }

    let report = services.shutdown(grace);
    services.drain(&mut deliveries, &mut printer);
    println!(
        "shutdown: cancelled_pending={} abandoned={}",
        report.cancelled_pending, report.abandoned
    );
    submitted
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("offload: {err}");
        std::process::exit(1);
    }
}
