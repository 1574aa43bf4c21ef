//! Ticker - 定期実行のバックグラウンドスレッド
//!
//! 停止は condvar で即座に伝わる。watchdog の sweeper、キャッシュの
//! メンテナンス、debounce の flusher が使う。

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.condvar.notify_all();
    }

    /// Sleep for `interval` or until stopped. Returns true when stopped.
    fn wait(&self, interval: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .condvar
            .wait_timeout_while(guard, interval, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Handle to a running ticker.
/// - `request_shutdown()` stops it without waiting
/// - `shutdown_and_join()` stops it and waits for the current tick to finish
/// - dropping the handle requests shutdown
pub struct Ticker {
    signal: Arc<StopSignal>,
    join: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Run `tick` every `interval` on a named thread. The first tick happens
    /// one interval after spawning. `on_stop` runs once on the ticker thread
    /// after the last tick.
    pub fn spawn<F, S>(name: &str, interval: Duration, mut tick: F, on_stop: S) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
        S: FnOnce() + Send + 'static,
    {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);
        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            while !thread_signal.wait(interval) {
                tick();
            }
            on_stop();
        })?;
        Ok(Self {
            signal,
            join: Some(join),
        })
    }

    pub fn request_shutdown(&self) {
        self.signal.stop();
    }

    pub fn shutdown_and_join(mut self) {
        self.request_shutdown();
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            tracing::warn!("ticker thread panicked");
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.signal.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn ticks_until_stopped_then_runs_on_stop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));

        let ticker = Ticker::spawn(
            "test-ticker",
            Duration::from_millis(10),
            {
                let ticks = Arc::clone(&ticks);
                move || {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            },
            {
                let stopped = Arc::clone(&stopped);
                move || stopped.store(true, Ordering::SeqCst)
            },
        )
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        ticker.shutdown_and_join();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_does_not_wait_for_the_interval() {
        let ticker = Ticker::spawn("slow-ticker", Duration::from_secs(3600), || {}, || {}).unwrap();
        let start = Instant::now();
        ticker.shutdown_and_join();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
