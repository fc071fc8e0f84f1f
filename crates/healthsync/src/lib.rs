//! Healthsync crate - Resumable incremental sync of device health data
//!
//! This crate provides platform-independent sync functionality including:
//! - Domain models (samples, cursors, credentials, session state)
//! - Anchor, session and credential storage behind traits
//! - A crash-safe outbox that stages every upload before sending it
//! - Token refresh and the backend wire format
//! - The sync orchestrator and trigger coordinator
//!
//! The platform health store and background scheduler stay outside: they
//! plug in through [`HealthSource`] and the [`TriggerCoordinator`]
//! entrypoints, natively or over UniFFI.

uniffi::setup_scaffolding!();

pub mod api;
pub mod config;
pub mod error;
pub mod ffi;
pub mod models;
pub mod outbox;
pub mod source;
pub mod storage;
pub mod sync;

pub use api::{HttpTransport, MockTransport, TokenManager, UreqTransport};
pub use config::{SyncConfig, UploadMode};
pub use error::{ConfigError, UploadError};
pub use models::{
    Credentials, Cursor, DataTypeId, PluginSettings, ReadBatch, ReadRequest, Sample, SourceInfo,
    SyncSessionState, TypeProgress, UserKey,
};
pub use outbox::{CandidateCursor, Outbox, OutboxItem, RetryReport, SupersedeReport, UploadResult};
pub use source::{HealthSource, InMemoryHealthSource};
pub use storage::{
    AnchorStore, CredentialStore, FileCredentialStore, InMemoryCredentialStore,
    InMemorySyncStore, SessionStore, SqliteSyncStore,
};
pub use sync::{
    SyncBudget, SyncDependencies, SyncEngine, SyncObserver, SyncOutcome, SyncStage, SyncStats,
    SyncStatus, TriggerCoordinator,
};
