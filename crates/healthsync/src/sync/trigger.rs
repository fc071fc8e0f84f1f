//! Maps platform triggers onto sync passes
//!
//! Manual calls, health store change callbacks, periodic background
//! invocations and app foregrounding can arrive on any thread. Change
//! callbacks are debounced by a worker thread so a burst of notifications
//! becomes a single pass.

use anyhow::{Context, Result};
use log::{debug, info};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::budget::SyncBudget;
use super::engine::{SyncEngine, SyncOutcome};

/// A burst of notifications delays its pass by at most this many windows
const MAX_DEFER_WINDOWS: u32 = 5;

#[derive(Default)]
struct DebounceInner {
    deadline: Option<Instant>,
    /// First notification of the current burst
    first_pending: Option<Instant>,
    shutdown: bool,
}

#[derive(Default)]
struct Debouncer {
    inner: Mutex<DebounceInner>,
    signal: Condvar,
}

impl Debouncer {
    fn lock(&self) -> MutexGuard<'_, DebounceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push the deadline out by `window`, capped relative to the burst start
    fn schedule(&self, window: Duration) {
        let now = Instant::now();
        let mut inner = self.lock();
        let first = *inner.first_pending.get_or_insert(now);
        inner.deadline = Some(next_deadline(now, first, window));
        drop(inner);
        self.signal.notify_all();
    }
}

fn next_deadline(now: Instant, first_pending: Instant, window: Duration) -> Instant {
    (now + window).min(first_pending + window * MAX_DEFER_WINDOWS)
}

pub struct TriggerCoordinator {
    engine: Arc<SyncEngine>,
    debouncer: Arc<Debouncer>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerCoordinator {
    /// Start the debounce worker for `engine`
    pub fn new(engine: Arc<SyncEngine>) -> Result<Self> {
        let debouncer = Arc::new(Debouncer::default());
        let worker = {
            let engine = engine.clone();
            let debouncer = debouncer.clone();
            std::thread::Builder::new()
                .name("health-sync-debounce".to_string())
                .spawn(move || debounce_loop(&engine, &debouncer))
                .context("Failed to spawn debounce worker")?
        };

        Ok(Self {
            engine,
            debouncer,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// User pressed "sync now"
    pub fn on_manual_sync_requested(&self) -> SyncOutcome {
        self.engine.sync_now()
    }

    /// The health store reported new data
    ///
    /// Returns whether a pass was scheduled. Ignored while background sync
    /// is disabled.
    pub fn on_health_store_change_notified(&self) -> bool {
        if !self.engine.is_sync_active() {
            debug!("Change notification ignored: background sync inactive");
            return false;
        }
        self.debouncer.schedule(self.engine.config().debounce());
        true
    }

    /// The OS granted background time; `None` when background sync is disabled
    pub fn on_periodic_background_invocation(&self, budget: &SyncBudget) -> Option<SyncOutcome> {
        if !self.engine.is_sync_active() {
            debug!("Background invocation ignored: background sync inactive");
            return None;
        }
        Some(self.engine.run_sync_with_budget(false, budget))
    }

    /// The app came to the foreground; only runs when there is work to finish
    pub fn on_app_foregrounded(&self) -> Option<SyncOutcome> {
        if !self.engine.has_pending_work() {
            return None;
        }
        info!("Resuming unfinished sync work on foreground");
        Some(self.engine.sync_now())
    }

    /// Whether a debounced pass is waiting to run
    pub fn has_scheduled_sync(&self) -> bool {
        self.debouncer.lock().deadline.is_some()
    }

    /// Stop the debounce worker; a pending debounced pass is dropped
    pub fn shutdown(&self) {
        self.debouncer.lock().shutdown = true;
        self.debouncer.signal.notify_all();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.join().ok();
        }
    }
}

impl Drop for TriggerCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn debounce_loop(engine: &SyncEngine, debouncer: &Debouncer) {
    let mut inner = debouncer.lock();
    loop {
        if inner.shutdown {
            return;
        }

        let Some(deadline) = inner.deadline else {
            inner = debouncer
                .signal
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        };

        let now = Instant::now();
        if now < deadline {
            inner = debouncer
                .signal
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }

        inner.deadline = None;
        inner.first_pending = None;
        drop(inner);

        // Background sync may have been stopped during the window
        if !engine.is_sync_active() {
            debug!("Debounced sync dropped: background sync inactive");
            inner = debouncer.lock();
            continue;
        }

        debug!("Running debounced sync");
        let outcome = engine.run_sync(false);

        inner = debouncer.lock();
        if outcome == SyncOutcome::AlreadyRunning && inner.deadline.is_none() {
            // The running pass may have missed the new data
            let now = Instant::now();
            inner.first_pending = Some(now);
            inner.deadline = Some(now + engine.config().debounce());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_sets_deadline() {
        let debouncer = Debouncer::default();
        assert!(debouncer.lock().deadline.is_none());

        debouncer.schedule(Duration::from_secs(5));
        let first = debouncer.lock().deadline.unwrap();
        debouncer.schedule(Duration::from_secs(10));
        assert!(debouncer.lock().deadline.unwrap() > first);
    }

    #[test]
    fn test_steady_notifications_cannot_postpone_forever() {
        let window = Duration::from_secs(2);
        let first = Instant::now();

        // Early in a burst the window slides
        let early = first + Duration::from_secs(1);
        assert_eq!(next_deadline(early, first, window), early + window);

        // Later ones are capped at five windows after the first notification
        let late = first + Duration::from_secs(9);
        assert_eq!(next_deadline(late, first, window), first + window * 5);
        let later = first + Duration::from_secs(60);
        assert_eq!(next_deadline(later, first, window), first + window * 5);
    }

    #[test]
    fn test_burst_start_is_kept_until_the_pass_fires() {
        let debouncer = Debouncer::default();
        debouncer.schedule(Duration::from_secs(1));
        let first = debouncer.lock().first_pending.unwrap();

        std::thread::sleep(Duration::from_millis(20));
        debouncer.schedule(Duration::from_secs(1));
        let inner = debouncer.lock();
        assert_eq!(inner.first_pending, Some(first));
        assert!(inner.deadline.unwrap() <= first + Duration::from_secs(5));
    }
}
