//! FFI bindings for UniFFI export
//!
//! This module provides Swift/Kotlin bindings for the healthsync crate via UniFFI.
//!
//! ## Usage from Swift
//!
//! ```swift
//! import HealthSyncFFI
//!
//! // Route Rust logs to os_log first
//! initializeLogging(callback: myLogCallback, maxLevel: .info)
//!
//! let service = try HealthSyncService(
//!     dataDir: appSupportDir.path,
//!     config: FfiSyncConfig(host: "https://api.example.com", ...),
//!     source: HealthKitSource()
//! )
//!
//! try service.signIn(credentials: FfiCredentials(userId: userId, accessToken: token, ...))
//! let granted = try service.requestAuthorization(typeIds: ["steps", "heartRate"])
//! try service.startBackgroundSync()
//!
//! // From the HKObserverQuery handler
//! service.notifyHealthStoreChanged()
//!
//! // From a BGProcessingTask
//! task.expirationHandler = { service.expireBackgroundBudget() }
//! let outcome = service.syncInBackground(budgetSecs: 25)
//! ```

mod logging;
mod service;
mod types;

pub use logging::{init_ffi_logger, initialize_logging, set_log_callback, set_log_level, set_logging_level};
pub use service::*;
pub use types::*;
