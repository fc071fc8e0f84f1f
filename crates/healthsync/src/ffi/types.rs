//! FFI-friendly type wrappers for UniFFI export
//!
//! These types convert internal Rust types to FFI-compatible versions:
//! - `DateTime<Utc>` → `i64` (Unix milliseconds)
//! - `DataTypeId`/`Cursor` → `String`
//! - Sample values → separate numeric and text maps

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::{ConfigError, UploadError};
use crate::models::{Credentials, Cursor, DataTypeId, ReadBatch, Sample, SourceInfo};
use crate::sync::{SyncOutcome, SyncStats, SyncStatus};
use crate::{SyncConfig, UploadMode};

// ============================================================================
// Error Types
// ============================================================================

/// FFI-friendly error type
#[derive(Debug, Clone, thiserror::Error, uniffi::Error)]
pub enum HealthSyncError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Authentication required: {message}")]
    AuthRequired { message: String },

    #[error("Health source error: {message}")]
    Source { message: String },
}

impl From<anyhow::Error> for HealthSyncError {
    fn from(e: anyhow::Error) -> Self {
        if let Some(err) = e.downcast_ref::<HealthSyncError>() {
            return err.clone();
        }
        if let Some(config) = e.downcast_ref::<ConfigError>() {
            let message = config.to_string();
            return match config {
                ConfigError::MissingUser | ConfigError::MissingToken => {
                    HealthSyncError::AuthRequired { message }
                }
                _ => HealthSyncError::Config { message },
            };
        }
        if let Some(upload) = e.downcast_ref::<UploadError>() {
            return HealthSyncError::Network {
                message: upload.to_string(),
            };
        }
        HealthSyncError::Storage {
            message: format!("{:#}", e),
        }
    }
}

impl From<uniffi::UnexpectedUniFFICallbackError> for HealthSyncError {
    fn from(e: uniffi::UnexpectedUniFFICallbackError) -> Self {
        HealthSyncError::Source { message: e.reason }
    }
}

fn to_datetime(millis: i64) -> Result<DateTime<Utc>, HealthSyncError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| HealthSyncError::Source {
        message: format!("Timestamp out of range: {}", millis),
    })
}

// ============================================================================
// Configuration
// ============================================================================

/// FFI-friendly sync configuration; unset fields keep their defaults
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncConfig {
    pub host: String,
    /// Path segment of the sync endpoint ("apple", "samsung", ...)
    pub platform: Option<String>,
    pub endpoint_template: Option<String>,
    pub chunk_size: Option<u32>,
    /// Bundle every type into one payload sequence
    pub combined_upload: bool,
    pub read_limit: Option<u32>,
    pub full_export_lookback_days: Option<u32>,
    pub outbox_grace_secs: Option<u64>,
    pub debounce_ms: Option<u64>,
    pub http_timeout_secs: Option<u64>,
}

impl From<FfiSyncConfig> for SyncConfig {
    fn from(c: FfiSyncConfig) -> Self {
        let mut config = SyncConfig::new(c.host);
        if let Some(platform) = c.platform {
            config = config.with_platform(platform);
        }
        if let Some(template) = c.endpoint_template {
            config = config.with_endpoint_template(template);
        }
        if let Some(chunk_size) = c.chunk_size {
            config = config.with_chunk_size(chunk_size as usize);
        }
        if c.combined_upload {
            config = config.with_upload_mode(UploadMode::Combined);
        }
        if let Some(limit) = c.read_limit {
            config = config.with_read_limit(limit as usize);
        }
        if let Some(days) = c.full_export_lookback_days {
            config.full_export_lookback_days = days;
        }
        if let Some(secs) = c.outbox_grace_secs {
            config = config.with_outbox_grace_secs(secs);
        }
        if let Some(ms) = c.debounce_ms {
            config = config.with_debounce_ms(ms);
        }
        if let Some(secs) = c.http_timeout_secs {
            config.http_timeout_secs = secs;
        }
        config
    }
}

/// FFI-friendly credentials
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiCredentials {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    /// Unix milliseconds
    pub token_expiry: Option<i64>,
}

impl TryFrom<FfiCredentials> for Credentials {
    type Error = HealthSyncError;

    fn try_from(c: FfiCredentials) -> Result<Self, Self::Error> {
        let mut creds = Credentials::new(c.user_id, c.access_token);
        creds.refresh_token = c.refresh_token.filter(|t| !t.is_empty());
        creds.app_id = c.app_id;
        creds.app_secret = c.app_secret;
        creds.token_expiry = c
            .token_expiry
            .map(|ms| {
                DateTime::from_timestamp_millis(ms).ok_or_else(|| HealthSyncError::Config {
                    message: format!("Token expiry out of range: {}", ms),
                })
            })
            .transpose()?;
        Ok(creds)
    }
}

// ============================================================================
// Samples
// ============================================================================

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSourceInfo {
    pub name: String,
    pub bundle_id: Option<String>,
    pub device: Option<String>,
}

impl From<FfiSourceInfo> for SourceInfo {
    fn from(s: FfiSourceInfo) -> Self {
        Self {
            name: s.name,
            bundle_id: s.bundle_id,
            device: s.device,
        }
    }
}

/// One sample read from the platform health store
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSample {
    pub id: String,
    pub type_id: String,
    /// Unix milliseconds
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub numeric_values: HashMap<String, f64>,
    pub text_values: HashMap<String, String>,
    pub source: FfiSourceInfo,
}

impl TryFrom<FfiSample> for Sample {
    type Error = HealthSyncError;

    fn try_from(s: FfiSample) -> Result<Self, Self::Error> {
        let mut sample = Sample::new(s.id, DataTypeId::new(s.type_id), to_datetime(s.start_time)?)
            .with_source(s.source.into());
        if let Some(end) = s.end_time {
            sample = sample.with_end_time(to_datetime(end)?);
        }
        for (key, value) in s.numeric_values {
            sample = sample.with_value(key, value);
        }
        for (key, value) in s.text_values {
            sample = sample.with_value(key, value);
        }
        Ok(sample)
    }
}

/// Result of a foreign `read_since`
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiReadBatch {
    pub samples: Vec<FfiSample>,
    pub new_cursor: Option<String>,
}

impl TryFrom<FfiReadBatch> for ReadBatch {
    type Error = HealthSyncError;

    fn try_from(b: FfiReadBatch) -> Result<Self, Self::Error> {
        let samples = b
            .samples
            .into_iter()
            .map(Sample::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ReadBatch::new(samples, b.new_cursor.map(Cursor::new)))
    }
}

// ============================================================================
// Sync Results
// ============================================================================

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncStats {
    pub uploads: u32,
    pub records_sent: u64,
    pub types_completed: u32,
    pub retried_items: u32,
    pub deferred_types: u32,
    pub resumed: bool,
    pub full_export: bool,
    pub duration_ms: u64,
}

impl From<SyncStats> for FfiSyncStats {
    fn from(s: SyncStats) -> Self {
        Self {
            uploads: s.uploads as u32,
            records_sent: s.records_sent as u64,
            types_completed: s.types_completed as u32,
            retried_items: s.retried_items as u32,
            deferred_types: s.deferred_types as u32,
            resumed: s.resumed,
            full_export: s.full_export,
            duration_ms: s.duration_ms,
        }
    }
}

#[derive(Debug, Clone, uniffi::Enum)]
pub enum FfiSyncOutcome {
    Completed { stats: FfiSyncStats },
    AlreadyRunning,
    NotConfigured { message: String },
    TokenUnavailable,
    AuthFailed,
    Interrupted { stats: FfiSyncStats },
    Deferred { stats: FfiSyncStats },
    Failed { stage: String, message: String },
}

impl From<SyncOutcome> for FfiSyncOutcome {
    fn from(o: SyncOutcome) -> Self {
        match o {
            SyncOutcome::Completed(stats) => FfiSyncOutcome::Completed {
                stats: stats.into(),
            },
            SyncOutcome::AlreadyRunning => FfiSyncOutcome::AlreadyRunning,
            SyncOutcome::NotConfigured(message) => FfiSyncOutcome::NotConfigured { message },
            SyncOutcome::TokenUnavailable => FfiSyncOutcome::TokenUnavailable,
            SyncOutcome::AuthFailed => FfiSyncOutcome::AuthFailed,
            SyncOutcome::Interrupted(stats) => FfiSyncOutcome::Interrupted {
                stats: stats.into(),
            },
            SyncOutcome::Deferred(stats) => FfiSyncOutcome::Deferred {
                stats: stats.into(),
            },
            SyncOutcome::Failed { stage, message } => FfiSyncOutcome::Failed {
                stage: stage.to_string(),
                message,
            },
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncStatus {
    pub has_resumable_session: bool,
    pub sent_count: u64,
    pub is_full_export: bool,
    /// Unix milliseconds
    pub created_at: Option<i64>,
    pub pending_outbox_items: u32,
    pub is_running: bool,
}

/// Staged upload handed to a platform background transfer
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiStagedUpload {
    pub item_id: String,
    pub url: String,
    /// Uncompressed JSON request body
    pub body: Vec<u8>,
    pub record_count: u64,
}

impl From<SyncStatus> for FfiSyncStatus {
    fn from(s: SyncStatus) -> Self {
        Self {
            has_resumable_session: s.has_resumable_session,
            sent_count: s.sent_count,
            is_full_export: s.is_full_export,
            created_at: s.created_at.map(|t| t.timestamp_millis()),
            pending_outbox_items: s.pending_outbox_items as u32,
            is_running: s.is_running,
        }
    }
}

// ============================================================================
// Callbacks
// ============================================================================

/// Platform health store implemented in Swift/Kotlin
#[uniffi::export(callback_interface)]
pub trait FfiHealthSource: Send + Sync {
    /// Returns the granted subset of `type_ids`
    fn request_permission(&self, type_ids: Vec<String>) -> Result<Vec<String>, HealthSyncError>;

    /// Samples after `cursor`, or since `since` (Unix milliseconds) without one
    fn read_since(
        &self,
        type_id: String,
        cursor: Option<String>,
        since: Option<i64>,
        limit: Option<u32>,
    ) -> Result<FfiReadBatch, HealthSyncError>;
}

/// Callback interface for per-type sync progress
#[uniffi::export(callback_interface)]
pub trait SyncProgressCallback: Send + Sync {
    fn on_type_progress(&self, type_id: String, sent_count: u64, is_complete: bool);
}

// ============================================================================
// Log Callback
// ============================================================================

/// Log level for FFI callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<log::Level> for FfiLogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => FfiLogLevel::Error,
            log::Level::Warn => FfiLogLevel::Warn,
            log::Level::Info => FfiLogLevel::Info,
            log::Level::Debug => FfiLogLevel::Debug,
            log::Level::Trace => FfiLogLevel::Trace,
        }
    }
}

impl From<FfiLogLevel> for log::Level {
    fn from(level: FfiLogLevel) -> Self {
        match level {
            FfiLogLevel::Error => log::Level::Error,
            FfiLogLevel::Warn => log::Level::Warn,
            FfiLogLevel::Info => log::Level::Info,
            FfiLogLevel::Debug => log::Level::Debug,
            FfiLogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Receives log records from Rust
///
/// Swift should route these to os_log/Logger, Kotlin to Logcat.
#[uniffi::export(callback_interface)]
pub trait LogCallback: Send + Sync {
    /// `target` is the module path, e.g. "healthsync::sync::engine"
    fn on_log(&self, level: FfiLogLevel, target: String, message: String);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_conversion() {
        let sample = FfiSample {
            id: "s1".to_string(),
            type_id: "heartRate".to_string(),
            start_time: 1_700_000_000_000,
            end_time: Some(1_700_000_060_000),
            numeric_values: HashMap::from([("bpm".to_string(), 62.0)]),
            text_values: HashMap::from([("context".to_string(), "resting".to_string())]),
            source: FfiSourceInfo {
                name: "Watch".to_string(),
                bundle_id: None,
                device: None,
            },
        };

        let sample = Sample::try_from(sample).unwrap();
        assert_eq!(sample.type_id, DataTypeId::new("heartRate"));
        assert_eq!(sample.value_fields["bpm"], serde_json::json!(62.0));
        assert_eq!(sample.value_fields["context"], serde_json::json!("resting"));
        assert_eq!(sample.end_time.unwrap().timestamp(), 1_700_000_060);
    }

    #[test]
    fn test_config_error_classification() {
        let err: HealthSyncError = anyhow::Error::from(ConfigError::MissingUser).into();
        assert!(matches!(err, HealthSyncError::AuthRequired { .. }));

        let err: HealthSyncError = anyhow::Error::from(ConfigError::MissingHost).into();
        assert!(matches!(err, HealthSyncError::Config { .. }));

        let err: HealthSyncError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, HealthSyncError::Storage { .. }));
    }

    #[test]
    fn test_ffi_config_defaults() {
        let config: SyncConfig = FfiSyncConfig {
            host: "https://api.example.com/".to_string(),
            platform: None,
            endpoint_template: None,
            chunk_size: Some(500),
            combined_upload: true,
            read_limit: None,
            full_export_lookback_days: None,
            outbox_grace_secs: None,
            debounce_ms: None,
            http_timeout_secs: None,
        }
        .into();

        assert_eq!(config.host, "https://api.example.com");
        assert_eq!(config.platform, "apple");
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.upload_mode, UploadMode::Combined);
    }
}
