// Cycle scheduler — the fixed-interval poll loop every role runs on.
//
// Time and sleeping are injected (Clock, Sleeper) so tests can drive the loop
// deterministically. A role implements CycleTask: `ready` waits for work and
// may be cancelled on shutdown; `run_cycle` is never cancelled once started,
// so an in-flight store call always completes or fails on its own.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by_ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeping on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested sleeps and returns immediately, advancing a
/// ManualClock if one is attached.
#[derive(Debug, Default)]
pub struct ManualSleeper {
    clock: Option<Arc<ManualClock>>,
    slept: Mutex<Vec<Duration>>,
}

impl ManualSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        Self {
            clock: Some(clock),
            slept: Mutex::new(Vec::new()),
        }
    }

    /// Every sleep requested so far, in order.
    pub fn slept(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for ManualSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
        if let Some(clock) = &self.clock {
            clock.advance(duration);
        }
        // Let other tasks run, as a real sleep would.
        tokio::task::yield_now().await;
    }
}

/// One unit of repeated work.
#[async_trait]
pub trait CycleTask: Send {
    /// Wait until there is something to do. Cancelled if shutdown is
    /// requested while waiting.
    async fn ready(&mut self) -> Result<()> {
        Ok(())
    }

    /// Run one cycle at time `now_ms`. Errors are logged by the scheduler and
    /// the loop carries on.
    async fn run_cycle(&mut self, now_ms: i64) -> Result<()>;
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    interval: Duration,
    max_cycles: Option<u64>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>, interval: Duration) -> Self {
        Self {
            clock,
            sleeper,
            interval,
            max_cycles: None,
        }
    }

    /// Stop after this many cycles. Used by tests.
    pub fn with_max_cycles(mut self, max_cycles: u64) -> Self {
        self.max_cycles = Some(max_cycles);
        self
    }

    /// Run cycles until shutdown is requested (or `max_cycles` is reached).
    /// Returns the number of cycles run.
    pub async fn run<T: CycleTask>(&self, task: &mut T, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut cycles = 0u64;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }

            tokio::select! {
                ready = task.ready() => {
                    if let Err(e) = ready {
                        warn!(error = %e, "Waiting for work failed");
                        self.sleeper.sleep(self.interval).await;
                        continue;
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            let now_ms = self.clock.now_ms();
            if let Err(e) = task.run_cycle(now_ms).await {
                error!(error = %e, "Cycle failed, retrying next interval");
            }
            cycles += 1;

            if !self.interval.is_zero() {
                tokio::select! {
                    _ = self.sleeper.sleep(self.interval) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
            }
        }

        info!(cycles, "Scheduler stopped");
        cycles
    }
}

/// Resolves once shutdown has been requested. Never resolves if the sender
/// is gone without requesting it.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Listen for Ctrl-C (and SIGTERM on Unix) and flip the returned flag.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Shutdown requested, finishing current cycle");
        let _ = tx.send(true);
    });

    rx
}
