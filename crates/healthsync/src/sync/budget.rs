//! Time budget for background invocations
//!
//! The OS grants a background task a bounded amount of time and may call an
//! expiration handler early. The sync loop checks the budget only at type
//! and chunk boundaries; an upload already in flight always completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SyncBudget {
    deadline: Option<Instant>,
    expired: Arc<AtomicBool>,
}

impl SyncBudget {
    /// Budget for foreground work: never exhausted unless expired by hand
    pub fn unlimited() -> Self {
        Self {
            deadline: None,
            expired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Budget that runs out `duration` from now
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + duration),
            expired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Called from the OS expiration handler; visible to every clone
    pub fn expire(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    /// No new unit of work may start
    pub fn is_exhausted(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn remaining(&self) -> Option<Duration> {
        if self.expired.load(Ordering::SeqCst) {
            return Some(Duration::ZERO);
        }
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

impl Default for SyncBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}
