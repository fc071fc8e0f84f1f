//! HealthSyncService facade for UniFFI export
//!
//! Wires the SQLite store, file credential store, outbox and HTTP transport
//! to a foreign health source, and exposes the plugin entrypoints.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::api::UreqTransport;
use crate::ffi::types::*;
use crate::models::{DataTypeId, ReadBatch, ReadRequest};
use crate::source::HealthSource;
use crate::storage::{FileCredentialStore, SqliteSyncStore};
use crate::sync::{SyncBudget, SyncDependencies, SyncEngine, SyncObserver, TriggerCoordinator};
use crate::SyncConfig;

const DATABASE_FILE: &str = "health-sync.sqlite";
const OUTBOX_DIR: &str = "outbox";

/// [`HealthSource`] backed by a Swift/Kotlin implementation
struct ForeignHealthSource {
    inner: Box<dyn FfiHealthSource>,
}

impl HealthSource for ForeignHealthSource {
    fn request_permission(&self, type_ids: &[DataTypeId]) -> Result<Vec<DataTypeId>> {
        let requested = type_ids.iter().map(|t| t.as_str().to_string()).collect();
        let granted = self.inner.request_permission(requested)?;
        Ok(granted.into_iter().map(DataTypeId::new).collect())
    }

    fn read_since(&self, request: &ReadRequest) -> Result<ReadBatch> {
        let batch = self.inner.read_since(
            request.type_id.as_str().to_string(),
            request.cursor.as_ref().map(|c| c.as_str().to_string()),
            request.since.map(|t| t.timestamp_millis()),
            request.limit.map(|l| u32::try_from(l).unwrap_or(u32::MAX)),
        )?;
        Ok(ReadBatch::try_from(batch)?)
    }
}

struct ProgressForwarder {
    callback: Box<dyn SyncProgressCallback>,
}

impl SyncObserver for ProgressForwarder {
    fn on_type_progress(&self, type_id: &DataTypeId, sent_count: u64, is_complete: bool) {
        self.callback
            .on_type_progress(type_id.as_str().to_string(), sent_count, is_complete);
    }
}

/// Main service object for health sync
///
/// Constructed once per process by the host app and shared by every
/// trigger source.
#[derive(uniffi::Object)]
pub struct HealthSyncService {
    engine: Arc<SyncEngine>,
    triggers: TriggerCoordinator,
    background_budget: Mutex<Option<SyncBudget>>,
}

#[uniffi::export]
impl HealthSyncService {
    /// Create the service
    ///
    /// # Arguments
    /// * `data_dir` - App-private directory for the database, credentials and outbox
    /// * `config` - Sync configuration; a host saved by `configure` takes precedence
    /// * `source` - Platform health store implementation
    #[uniffi::constructor]
    pub fn new(
        data_dir: String,
        config: FfiSyncConfig,
        source: Box<dyn FfiHealthSource>,
    ) -> Result<Arc<Self>, HealthSyncError> {
        let data_dir = PathBuf::from(data_dir);
        std::fs::create_dir_all(&data_dir).map_err(|e| HealthSyncError::Storage {
            message: format!("Failed to create data directory: {}", e),
        })?;

        let store = Arc::new(SqliteSyncStore::new(data_dir.join(DATABASE_FILE))?);
        let credentials = Arc::new(FileCredentialStore::new(&data_dir)?);
        let config = SyncConfig::from(config);
        let transport = Arc::new(UreqTransport::new(config.http_timeout()));

        let engine = Arc::new(SyncEngine::new(
            config,
            SyncDependencies {
                credentials,
                anchors: store.clone(),
                sessions: store,
                source: Arc::new(ForeignHealthSource { inner: source }),
                transport,
                outbox_dir: data_dir.join(OUTBOX_DIR),
            },
        )?);
        let triggers = TriggerCoordinator::new(engine.clone())?;

        Ok(Arc::new(Self {
            engine,
            triggers,
            background_budget: Mutex::new(None),
        }))
    }

    // ========================================================================
    // Setup
    // ========================================================================

    pub fn configure(&self, host: String, endpoint_template: Option<String>) -> Result<(), HealthSyncError> {
        Ok(self.engine.configure(&host, endpoint_template)?)
    }

    pub fn sign_in(&self, credentials: FfiCredentials) -> Result<(), HealthSyncError> {
        Ok(self.engine.sign_in(credentials.try_into()?)?)
    }

    pub fn sign_out(&self) -> Result<(), HealthSyncError> {
        Ok(self.engine.sign_out()?)
    }

    /// Request read access; returns the granted types, which become the tracked list
    pub fn request_authorization(&self, type_ids: Vec<String>) -> Result<Vec<String>, HealthSyncError> {
        let type_ids: Vec<DataTypeId> = type_ids.into_iter().map(DataTypeId::new).collect();
        let granted = self.engine.request_authorization(&type_ids)?;
        Ok(granted.into_iter().map(|t| t.as_str().to_string()).collect())
    }

    pub fn start_background_sync(&self) -> Result<(), HealthSyncError> {
        Ok(self.engine.start_background_sync()?)
    }

    pub fn stop_background_sync(&self) -> Result<(), HealthSyncError> {
        Ok(self.engine.stop_background_sync()?)
    }

    pub fn is_sync_active(&self) -> bool {
        self.engine.is_sync_active()
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    pub fn sync_now(&self) -> FfiSyncOutcome {
        self.triggers.on_manual_sync_requested().into()
    }

    /// Run from an OS background task with `budget_secs` of granted time
    ///
    /// Returns `None` when background sync is disabled.
    pub fn sync_in_background(&self, budget_secs: u64) -> Option<FfiSyncOutcome> {
        let budget = SyncBudget::with_duration(Duration::from_secs(budget_secs));
        *self.budget_slot() = Some(budget.clone());
        let outcome = self.triggers.on_periodic_background_invocation(&budget);
        *self.budget_slot() = None;
        outcome.map(FfiSyncOutcome::from)
    }

    /// Call from the OS expiration handler of a background task
    pub fn expire_background_budget(&self) {
        if let Some(budget) = self.budget_slot().as_ref() {
            budget.expire();
        }
    }

    /// Call from the health store observer; returns whether a sync was scheduled
    pub fn notify_health_store_changed(&self) -> bool {
        self.triggers.on_health_store_change_notified()
    }

    pub fn app_did_become_active(&self) -> Option<FfiSyncOutcome> {
        self.triggers.on_app_foregrounded().map(FfiSyncOutcome::from)
    }

    pub fn resume_sync(&self) -> Option<FfiSyncOutcome> {
        self.engine.resume_sync().map(FfiSyncOutcome::from)
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn reset_anchors(&self) -> Result<(), HealthSyncError> {
        Ok(self.engine.reset_anchors()?)
    }

    pub fn get_sync_status(&self) -> Result<FfiSyncStatus, HealthSyncError> {
        Ok(self.engine.get_sync_status()?.into())
    }

    pub fn clear_sync_session(&self) -> Result<(), HealthSyncError> {
        Ok(self.engine.clear_sync_session()?)
    }

    pub fn has_pending_work(&self) -> bool {
        self.engine.has_pending_work()
    }

    /// Staged uploads for a platform background transfer session
    ///
    /// The host must send the `Authorization` header itself and report each
    /// result through `background_upload_completed`.
    pub fn staged_uploads(&self) -> Result<Vec<FfiStagedUpload>, HealthSyncError> {
        let Some(url) = self.engine.sync_endpoint()? else {
            return Ok(Vec::new());
        };
        let outbox = self.engine.outbox();
        self.engine
            .staged_uploads()?
            .into_iter()
            .map(|item| -> Result<FfiStagedUpload, HealthSyncError> {
                Ok(FfiStagedUpload {
                    body: outbox.read_payload(&item)?,
                    item_id: item.id,
                    url: url.clone(),
                    record_count: item.record_count as u64,
                })
            })
            .collect()
    }

    /// Report the HTTP status of a staged upload sent by the platform,
    /// possibly from a relaunched process; returns whether any cursor advanced
    pub fn background_upload_completed(
        &self,
        item_id: String,
        http_status: u16,
    ) -> Result<bool, HealthSyncError> {
        let committed = self
            .engine
            .on_background_upload_completed(&item_id, http_status)?;
        Ok(!committed.is_empty())
    }

    pub fn set_progress_callback(&self, callback: Box<dyn SyncProgressCallback>) {
        self.engine
            .set_observer(Some(Arc::new(ProgressForwarder { callback })));
    }

    pub fn clear_progress_callback(&self) {
        self.engine.set_observer(None);
    }

    /// Stop the debounce worker; call when the host tears the plugin down
    pub fn shutdown(&self) {
        self.triggers.shutdown();
    }
}

impl HealthSyncService {
    fn budget_slot(&self) -> std::sync::MutexGuard<'_, Option<SyncBudget>> {
        self.background_budget
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
