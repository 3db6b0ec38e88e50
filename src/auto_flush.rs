//! Quiet-period auto-flush scheduling.

use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Something a fired timer can flush: the assembler side of the timer link.
pub(crate) trait AutoFlushTarget: Send + Sync {
    /// Flush pending lines against the last-seen emission context.
    fn auto_flush(&self);
    /// The timer owned by this target.
    fn flush_timer(&self) -> &AutoFlushTimer;
}

/// One-shot timer that flushes an assembler once a configured quiet period
/// elapses with no new line arriving.
///
/// Re-arming is cancel-and-reschedule, never a reset of the residual timer:
/// a task that has already left the pending state cannot be reset, and
/// trying loses the re-arm entirely. Instead every [`AutoFlushTimer::start`]
/// invalidates whatever was scheduled (via a generation counter) and
/// schedules a fresh task with the full interval. A task that lost the
/// cancel race but already started runs to completion; the flush it
/// performs serializes against line arrivals on the assembler's own lock.
pub struct AutoFlushTimer {
    interval: Option<Duration>,
    runtime: Option<Handle>,
    target: Weak<dyn AutoFlushTarget>,
    inner: Mutex<TimerInner>,
}

#[derive(Default)]
struct TimerInner {
    stopped: bool,
    running: bool,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl AutoFlushTimer {
    pub(crate) fn new(
        interval: Option<Duration>,
        runtime: Option<Handle>,
        target: Weak<dyn AutoFlushTarget>,
    ) -> Self {
        Self {
            interval,
            runtime,
            target,
            inner: Mutex::new(TimerInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms (or re-arms) the quiet-period task.
    ///
    /// No-op when no interval is configured or the timer has been stopped.
    pub(crate) fn start(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };

        let mut inner = self.lock();
        if inner.stopped {
            return;
        }
        inner.generation += 1;
        let generation = inner.generation;
        if let Some(task) = inner.task.take() {
            task.abort();
        }

        let target = Weak::clone(&self.target);
        let task = runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(target) = target.upgrade() else {
                return;
            };
            let timer = target.flush_timer();

            // Claim the firing: a stale generation means a newer arrival
            // re-armed while we slept and this task must not flush.
            {
                let mut inner = timer.lock();
                if inner.stopped || inner.generation != generation {
                    return;
                }
                inner.running = true;
            }

            target.auto_flush();

            let mut inner = timer.lock();
            inner.running = false;
            if inner.generation == generation {
                inner.task = None;
            }
        });
        inner.task = Some(task);
    }

    /// Latches the stopped flag and cancels any pending task. Subsequent
    /// [`AutoFlushTimer::start`] calls are no-ops.
    pub(crate) fn stop(&self) {
        let mut inner = self.lock();
        inner.stopped = true;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
    }

    /// Whether an interval is configured at all.
    pub fn configured(&self) -> bool {
        self.interval.is_some()
    }

    /// A task is scheduled and has not started its flush.
    pub fn pending(&self) -> bool {
        if self.interval.is_none() {
            return false;
        }
        let inner = self.lock();
        inner.task.is_some() && !inner.running && !inner.stopped
    }

    /// The flush callback is executing right now.
    pub fn running(&self) -> bool {
        if self.interval.is_none() {
            return false;
        }
        self.lock().running
    }

    /// Terminal state: `stop` has been called, or no interval exists.
    pub fn stopped(&self) -> bool {
        match self.interval {
            None => true,
            Some(_) => self.lock().stopped,
        }
    }

    /// No task is scheduled or executing.
    pub fn finished(&self) -> bool {
        match self.interval {
            None => true,
            Some(_) => {
                let inner = self.lock();
                inner.task.is_none() && !inner.running
            }
        }
    }
}

impl std::fmt::Debug for AutoFlushTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoFlushTimer")
            .field("interval", &self.interval)
            .field("pending", &self.pending())
            .field("stopped", &self.stopped())
            .finish()
    }
}
