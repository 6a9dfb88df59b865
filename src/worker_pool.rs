//! Bounded pool that runs user code off the I/O tasks.
//!
//! Channel hooks, actions, timer callbacks and broker deliveries all go
//! through here. Work runs on tokio's blocking threads, at most `size` pieces
//! at a time, and a panic in one piece of work is logged and contained.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Threaded,
    /// Runs work on the calling thread. Only meant for tests and tools where
    /// deterministic ordering matters more than isolation.
    Inline,
}

#[derive(Clone)]
pub struct WorkerPool {
    handle: Option<Handle>,
    permits: Arc<Semaphore>,
    size: usize,
    mode: Mode,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("mode", &self.mode)
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like `tokio::spawn`.
    pub fn new(size: usize) -> Self {
        Self::with_handle(Handle::current(), size)
    }

    pub fn with_handle(handle: Handle, size: usize) -> Self {
        let size = size.max(1);
        Self {
            handle: Some(handle),
            permits: Arc::new(Semaphore::new(size)),
            size,
            mode: Mode::Threaded,
        }
    }

    /// A pool that executes work immediately on the caller's thread.
    ///
    /// Timers still need a runtime; they are only available when this is
    /// created inside one.
    pub fn inline() -> Self {
        Self {
            handle: Handle::try_current().ok(),
            permits: Arc::new(Semaphore::new(1)),
            size: 1,
            mode: Mode::Inline,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn handle(&self) -> Option<&Handle> {
        self.handle.as_ref()
    }

    /// Fire-and-forget execution of `work`.
    pub fn spawn<F>(&self, label: &'static str, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = match (self.mode, &self.handle) {
            (Mode::Threaded, Some(handle)) => handle.clone(),
            _ => {
                let _ = guarded(label, work);
                return;
            }
        };

        let permits = self.permits.clone();
        let blocking = handle.clone();
        handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(task = label, "worker pool closed; dropping work");
                return;
            };
            let _ = blocking.spawn_blocking(move || guarded(label, work)).await;
        });
    }

    /// Runs `work` on the pool and waits for it.
    ///
    /// Returns `None` when the work panicked; the panic has already been logged.
    pub async fn run<T, F>(&self, label: &'static str, work: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = match (self.mode, &self.handle) {
            (Mode::Threaded, Some(handle)) => handle.clone(),
            _ => return guarded(label, work),
        };

        let _permit = self.permits.clone().acquire_owned().await.ok()?;
        match handle.spawn_blocking(move || guarded(label, work)).await {
            Ok(result) => result,
            Err(e) => {
                error!(task = label, error = %e, "worker task failed to complete");
                None
            }
        }
    }

    /// Starts a recurring timer whose callback is dispatched onto the pool.
    ///
    /// The first tick fires one `interval` after the call. Returns `None` for
    /// a zero interval or when no runtime is available to drive the timer.
    pub fn every<F>(&self, label: &'static str, interval: Duration, tick: F) -> Option<TimerHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if interval.is_zero() {
            warn!(task = label, "zero interval; periodic timer not started");
            return None;
        }
        let Some(handle) = self.handle.clone() else {
            warn!(task = label, "no runtime available; periodic timer not started");
            return None;
        };
        let pool = self.clone();
        let tick = Arc::new(tick);
        let task = handle.spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let tick = tick.clone();
                pool.spawn(label, move || tick());
            }
        });
        Some(TimerHandle { task })
    }
}

/// Cancels its timer when stopped or dropped.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs `work`, logging and containing a panic. `None` means it panicked.
pub(crate) fn guarded<T>(label: &'static str, work: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(work)) {
        Ok(value) => Some(value),
        Err(panic) => {
            error!(task = label, panic = %panic_message(panic.as_ref()), "worker task panicked");
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
