//! `log` backend that forwards records to a foreign callback
//!
//! Records from this crate pass at the configured level. Records from
//! dependencies (HTTP, TLS, SQLite) only pass at `Warn` or above so the
//! host's console is not flooded during uploads.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use log::{Level, Log, Metadata, Record, SetLoggerError};

use super::types::{FfiLogLevel, LogCallback};

static FFI_LOGGER: OnceLock<FfiLogger> = OnceLock::new();

const CRATE_TARGET: &str = "healthsync";

struct FfiLogger {
    callback: RwLock<Option<Arc<dyn LogCallback>>>,
    max_level: RwLock<Level>,
}

impl FfiLogger {
    fn new(max_level: Level) -> Self {
        Self {
            callback: RwLock::new(None),
            max_level: RwLock::new(max_level),
        }
    }

    fn max_level(&self) -> Level {
        *self.max_level.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn level_for(&self, target: &str) -> Level {
        let max = self.max_level();
        if target.starts_with(CRATE_TARGET) {
            max
        } else {
            max.min(Level::Warn)
        }
    }
}

impl Log for FfiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback.on_log(
                FfiLogLevel::from(record.level()),
                record.target().to_string(),
                record.args().to_string(),
            );
        }
    }

    fn flush(&self) {}
}

/// Install the FFI logger as the global `log` backend
///
/// Fails if another logger was installed first. Records are dropped until a
/// callback is set.
pub fn init_ffi_logger(max_level: Level) -> Result<(), SetLoggerError> {
    let logger = FFI_LOGGER.get_or_init(|| FfiLogger::new(max_level));
    log::set_logger(logger)?;
    log::set_max_level(max_level.to_level_filter());
    Ok(())
}

/// Replace the callback receiving records; `None` silences output
pub fn set_log_callback(callback: Option<Arc<dyn LogCallback>>) {
    if let Some(logger) = FFI_LOGGER.get() {
        *logger.callback.write().unwrap_or_else(PoisonError::into_inner) = callback;
    }
}

pub fn set_log_level(level: Level) {
    if let Some(logger) = FFI_LOGGER.get() {
        *logger.max_level.write().unwrap_or_else(PoisonError::into_inner) = level;
        log::set_max_level(level.to_level_filter());
    }
}

/// Route Rust logs to `callback`
///
/// Safe to call more than once: later calls only swap the callback and level.
#[uniffi::export]
pub fn initialize_logging(callback: Box<dyn LogCallback>, max_level: FfiLogLevel) {
    let level = Level::from(max_level);
    if init_ffi_logger(level).is_err() {
        set_log_level(level);
    }
    set_log_callback(Some(Arc::from(callback)));
}

#[uniffi::export]
pub fn set_logging_level(level: FfiLogLevel) {
    set_log_level(Level::from(level));
}
