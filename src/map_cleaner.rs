//! Periodic reaping of idle stream identities.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// The map side of the cleaner link: something whose stale entries can be
/// swept.
pub(crate) trait SweepTarget: Send + Sync {
    /// Remove and terminally flush every entry past its eviction deadline.
    fn sweep_stale(&self);
    /// The cleaner owned by this target.
    fn cleaner(&self) -> &MapCleaner;
}

/// Background task that periodically sweeps an identity map for entries
/// whose eviction deadline has passed.
///
/// `start` is idempotent and cheap enough to call on every routed access;
/// the first call spawns the loop, later ones return after one flag check.
/// The task holds only a weak reference to the map, so dropping the codec
/// also ends the loop.
pub struct MapCleaner {
    interval: Duration,
    runtime: Handle,
    target: Weak<dyn SweepTarget>,
    notify: Arc<Notify>,
    inner: Mutex<CleanerInner>,
}

#[derive(Default)]
struct CleanerInner {
    running: bool,
    task: Option<JoinHandle<()>>,
}

impl MapCleaner {
    pub(crate) fn new(
        interval: Duration,
        runtime: Handle,
        target: Weak<dyn SweepTarget>,
    ) -> Self {
        Self {
            interval,
            runtime,
            target,
            notify: Arc::new(Notify::new()),
            inner: Mutex::new(CleanerInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CleanerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the sweep loop if it is not already running.
    pub(crate) fn start(&self) {
        let mut inner = self.lock();
        if inner.running {
            return;
        }
        inner.running = true;

        let interval = self.interval;
        let target = Weak::clone(&self.target);
        let notify = Arc::clone(&self.notify);
        inner.task = Some(self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = notify.notified() => {}
                }
                let Some(target) = target.upgrade() else {
                    break;
                };
                if !target.cleaner().is_running() {
                    break;
                }
                target.sweep_stale();
            }
        }));
    }

    /// Clears the running latch and wakes the task so it exits promptly.
    pub(crate) fn stop(&self) {
        let task = {
            let mut inner = self.lock();
            inner.running = false;
            inner.task.take()
        };
        self.notify.notify_one();
        drop(task);
    }

    /// Whether the sweep loop is currently scheduled.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }
}

impl std::fmt::Debug for MapCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapCleaner")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}
