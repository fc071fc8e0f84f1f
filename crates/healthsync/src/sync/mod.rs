//! Sync engine for delivering health samples
//!
//! Resumable, idempotent passes that can be safely retried from any trigger.

mod budget;
mod engine;
mod session;
pub(crate) mod timing;
mod trigger;

pub use budget::SyncBudget;
pub use engine::{
    SyncDependencies, SyncEngine, SyncObserver, SyncOutcome, SyncStage, SyncStats, SyncStatus,
};
pub use session::SessionManager;
pub use timing::window_elapsed;
pub use trigger::TriggerCoordinator;
