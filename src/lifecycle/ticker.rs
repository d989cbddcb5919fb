//! Periodic task ticker
//!
//! Fires a handler every `interval`. Fires never overlap: when the handler
//! from the previous fire is still running, the new fire is skipped and
//! logged rather than queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::pool::TaskPool;

pub type TickHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct TaskTicker {
    interval: Duration,
    handler: TickHandler,
    running: Arc<AtomicBool>,
    skipped: AtomicU64,
    stop: CancellationToken,
}

/// Clears the running flag even if the handler panics.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TaskTicker {
    pub fn new(interval: Duration, handler: TickHandler) -> Self {
        Self {
            interval,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            skipped: AtomicU64::new(0),
            stop: CancellationToken::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the timer loop. The first fire happens immediately.
    pub fn start(self: &Arc<Self>, pool: &TaskPool) {
        let ticker = self.clone();
        let handler_pool = pool.clone();
        pool.spawn(async move {
            info!("Ticker started, interval {:?}", ticker.interval);
            let mut tick = tokio::time::interval(ticker.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.stop.cancelled() => break,
                    _ = tick.tick() => ticker.fire(&handler_pool),
                }
            }
            debug!("Ticker loop exited");
        });
    }

    fn fire(&self, pool: &TaskPool) {
        if self.stop.is_cancelled() {
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Tick skipped, previous handler still running");
            return;
        }

        let guard = RunningGuard(self.running.clone());
        let task = (self.handler)();
        pool.spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    /// Prevents further fires. A handler already running is not interrupted.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            self.stop.cancel();
            info!("Ticker stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fires dropped because the handler was still busy
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}
