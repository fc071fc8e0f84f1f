//! Sync orchestrator
//!
//! [`SyncEngine`] owns the stores, the outbox and the token manager, and runs
//! at most one sync pass per process. A pass:
//!
//! 1. validates configuration and credentials
//! 2. refreshes the access token when inside the safety margin
//! 3. retries leftover outbox items
//! 4. resumes the stored session, or starts a new one
//! 5. queries, stages and uploads every tracked type in order
//! 6. finalizes the session
//!
//! Failures never escape a pass; they become a [`SyncOutcome`] while the
//! durable state stays resumable.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use super::budget::SyncBudget;
use super::session::SessionManager;
use crate::api::{HttpTransport, TokenManager, build_payload};
use crate::config::{SyncConfig, UploadMode};
use crate::error::{ConfigError, UploadError};
use crate::models::{
    Credentials, Cursor, DataTypeId, PluginSettings, ReadBatch, ReadRequest, Sample,
    SyncSessionState, UserKey, normalize_auth_header,
};
use crate::outbox::{COMBINED_SCOPE, CandidateCursor, NewOutboxItem, Outbox, OutboxItem, UploadResult};
use crate::source::HealthSource;
use crate::storage::{AnchorStore, CredentialStore, SessionStore};

/// Collaborators injected into a [`SyncEngine`]
pub struct SyncDependencies {
    pub credentials: Arc<dyn CredentialStore>,
    pub anchors: Arc<dyn AnchorStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub source: Arc<dyn HealthSource>,
    pub transport: Arc<dyn HttpTransport>,
    pub outbox_dir: PathBuf,
}

/// Receives per-type progress while a pass runs
pub trait SyncObserver: Send + Sync {
    fn on_type_progress(&self, type_id: &DataTypeId, sent_count: u64, is_complete: bool);
}

/// Step of a pass that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Session,
    Query,
    Stage,
    Upload,
    Commit,
    Finalize,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Session => "session",
            SyncStage::Query => "query",
            SyncStage::Stage => "stage",
            SyncStage::Upload => "upload",
            SyncStage::Commit => "commit",
            SyncStage::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Statistics from a sync pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncStats {
    /// Upload requests accepted during the pass
    pub uploads: usize,
    /// Records carried by those uploads
    pub records_sent: usize,
    pub types_completed: usize,
    /// Leftover outbox items delivered at pass start
    pub retried_items: usize,
    /// Types skipped because an upload for them may still be in flight
    pub deferred_types: usize,
    /// The pass continued a stored session
    pub resumed: bool,
    pub full_export: bool,
    pub duration_ms: u64,
}

/// Result of a `run_sync` call
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncStats),
    /// Another pass holds the lock; nothing was touched
    AlreadyRunning,
    NotConfigured(String),
    /// The token is expired and could not be refreshed
    TokenUnavailable,
    /// The backend rejected the token and refreshing did not help
    AuthFailed,
    /// The time budget ran out at a type or chunk boundary
    Interrupted(SyncStats),
    /// Some types were skipped while another sender may still be uploading
    /// them; the session stays open for the next pass
    Deferred(SyncStats),
    Failed { stage: SyncStage, message: String },
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }

    pub fn stats(&self) -> Option<&SyncStats> {
        match self {
            SyncOutcome::Completed(stats)
            | SyncOutcome::Interrupted(stats)
            | SyncOutcome::Deferred(stats) => Some(stats),
            _ => None,
        }
    }
}

/// Snapshot for status displays
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    pub has_resumable_session: bool,
    pub sent_count: u64,
    pub is_full_export: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub pending_outbox_items: usize,
    pub is_running: bool,
}

/// Holds the per-process running flag for the lifetime of a pass
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    config: RwLock<SyncConfig>,
    credentials: Arc<dyn CredentialStore>,
    anchors: Arc<dyn AnchorStore>,
    source: Arc<dyn HealthSource>,
    transport: Arc<dyn HttpTransport>,
    tokens: TokenManager,
    sessions: SessionManager,
    outbox: Outbox,
    running: AtomicBool,
    observer: RwLock<Option<Arc<dyn SyncObserver>>>,
}

impl SyncEngine {
    /// Build an engine; a host or endpoint template saved by `configure`
    /// overrides the one in `config`
    pub fn new(config: SyncConfig, deps: SyncDependencies) -> Result<Self> {
        let settings = deps.credentials.load_settings().unwrap_or_else(|e| {
            warn!("Failed to load plugin settings, using defaults: {:#}", e);
            PluginSettings::default()
        });
        let config = apply_settings(config, &settings);
        let outbox = Outbox::new(&deps.outbox_dir, config.outbox_grace_secs)?;

        Ok(Self {
            tokens: TokenManager::new(deps.credentials.clone(), deps.transport.clone()),
            sessions: SessionManager::new(deps.sessions, deps.anchors.clone()),
            config: RwLock::new(config),
            credentials: deps.credentials,
            anchors: deps.anchors,
            source: deps.source,
            transport: deps.transport,
            outbox,
            running: AtomicBool::new(false),
            observer: RwLock::new(None),
        })
    }

    pub fn config(&self) -> SyncConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn SyncObserver>>) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = observer;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    // ========================================================================
    // Entrypoints
    // ========================================================================

    /// Set the backend host and optional sync URL template
    pub fn configure(&self, host: &str, endpoint_template: Option<String>) -> Result<()> {
        let mut candidate = self.config().with_host(host);
        candidate.endpoint_template = endpoint_template.filter(|t| !t.trim().is_empty());
        candidate.validate()?;

        let mut settings = self.credentials.load_settings()?;
        settings.host = Some(candidate.host.clone());
        settings.endpoint_template = candidate.endpoint_template.clone();
        self.credentials.save_settings(&settings)?;

        info!("Configured backend host {}", candidate.host);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = candidate;
        Ok(())
    }

    /// Store credentials for the signed-in user
    pub fn sign_in(&self, credentials: Credentials) -> Result<()> {
        if credentials.user_id.trim().is_empty() {
            return Err(ConfigError::MissingUser.into());
        }
        if credentials.access_token.trim().is_empty() {
            return Err(ConfigError::MissingToken.into());
        }

        let mut credentials = credentials;
        credentials.user_id = credentials.user_id.trim().to_string();
        credentials.access_token = normalize_auth_header(&credentials.access_token);
        self.credentials.save_credentials(&credentials)?;
        info!("Signed in user {}", credentials.user_id);
        Ok(())
    }

    /// Forget the user: credentials, anchors, session and staged uploads
    pub fn sign_out(&self) -> Result<()> {
        if let Some(creds) = self.credentials.load_credentials()? {
            let user = creds.user_key();
            self.anchors.reset_all(&user)?;
            let dropped = self.outbox.clear_user(&user)?;
            if dropped > 0 {
                info!("Dropped {} staged uploads on sign out", dropped);
            }
        }
        self.sessions.clear()?;
        self.credentials.clear_all()?;

        let mut settings = self.credentials.load_settings()?;
        settings.sync_active = false;
        self.credentials.save_settings(&settings)?;
        info!("Signed out");
        Ok(())
    }

    /// Ask the health source for access and track the granted types
    pub fn request_authorization(&self, type_ids: &[DataTypeId]) -> Result<Vec<DataTypeId>> {
        let granted = self.source.request_permission(type_ids)?;
        let tracked: Vec<DataTypeId> = type_ids
            .iter()
            .filter(|t| granted.contains(t))
            .cloned()
            .collect();

        let mut settings = self.credentials.load_settings()?;
        settings.tracked_type_ids = tracked.clone();
        self.credentials.save_settings(&settings)?;

        info!("Tracking {} of {} requested types", tracked.len(), type_ids.len());
        Ok(tracked)
    }

    /// Enable change notifications and periodic invocations
    pub fn start_background_sync(&self) -> Result<()> {
        self.config().validate()?;
        if self.credentials.load_credentials()?.is_none() {
            return Err(ConfigError::MissingUser.into());
        }
        self.set_sync_active(true)
    }

    pub fn stop_background_sync(&self) -> Result<()> {
        self.set_sync_active(false)
    }

    fn set_sync_active(&self, active: bool) -> Result<()> {
        let mut settings = self.credentials.load_settings()?;
        settings.sync_active = active;
        self.credentials.save_settings(&settings)?;
        info!("Background sync {}", if active { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn is_sync_active(&self) -> bool {
        self.credentials
            .load_settings()
            .map(|s| s.sync_active)
            .unwrap_or(false)
    }

    /// Manual foreground sync
    pub fn sync_now(&self) -> SyncOutcome {
        self.run_sync(false)
    }

    /// Clear every cursor and the full-export flag so the next pass re-exports
    pub fn reset_anchors(&self) -> Result<()> {
        if self.is_running() {
            bail!("Cannot reset anchors while a sync is running");
        }
        let user = self.signed_in_user()?.ok_or(ConfigError::MissingUser)?;
        self.anchors.reset_all(&user)?;
        self.sessions.clear()?;
        self.outbox.clear_user(&user)?;
        info!("Reset anchors for {}", user);
        Ok(())
    }

    pub fn get_sync_status(&self) -> Result<SyncStatus> {
        let mut status = SyncStatus {
            is_running: self.is_running(),
            ..SyncStatus::default()
        };
        let Some(user) = self.signed_in_user()? else {
            return Ok(status);
        };

        if let Some(state) = self.sessions.load(&user) {
            status.has_resumable_session = state.has_resumable_progress();
            status.sent_count = state.total_sent_count;
            status.is_full_export = state.is_full_export;
            status.created_at = Some(state.created_at);
        }
        status.pending_outbox_items = self.outbox.count_for_user(&user)?;
        Ok(status)
    }

    /// Continue an interrupted session; `None` when there is nothing to resume
    pub fn resume_sync(&self) -> Option<SyncOutcome> {
        let user = self.signed_in_user().ok().flatten()?;
        if !self.sessions.has_resumable_progress(&user) {
            debug!("No resumable sync session");
            return None;
        }
        Some(self.run_sync(false))
    }

    /// Drop the stored session without touching anchors
    pub fn clear_sync_session(&self) -> Result<()> {
        if self.is_running() {
            bail!("Cannot clear the sync session while a sync is running");
        }
        self.sessions.clear()
    }

    /// Whether a resumable session or staged uploads exist for the user
    pub fn has_pending_work(&self) -> bool {
        let Ok(Some(user)) = self.signed_in_user() else {
            return false;
        };
        self.sessions.has_resumable_progress(&user)
            || self.outbox.count_for_user(&user).is_ok_and(|n| n > 0)
    }

    /// Staged uploads of the signed-in user, oldest first
    ///
    /// A host with an out-of-process transfer mechanism may send these
    /// itself and report back through [`SyncEngine::on_background_upload_completed`].
    pub fn staged_uploads(&self) -> Result<Vec<OutboxItem>> {
        match self.signed_in_user()? {
            Some(user) => self.outbox.pending_for_user(&user),
            None => Ok(Vec::new()),
        }
    }

    /// Upload URL for the signed-in user
    pub fn sync_endpoint(&self) -> Result<Option<String>> {
        let config = self.config();
        Ok(self
            .credentials
            .load_credentials()?
            .map(|creds| config.sync_url(&creds.user_id)))
    }

    /// Apply the HTTP status of a staged upload sent by the platform
    ///
    /// Returns the types whose cursors advanced; empty when the item was
    /// already resolved or not accepted.
    pub fn on_background_upload_completed(&self, item_id: &str, http_status: u16) -> Result<Vec<DataTypeId>> {
        let committed = self
            .outbox
            .complete_external(item_id, http_status, self.anchors.as_ref())?;
        Ok(committed.unwrap_or_default())
    }

    fn signed_in_user(&self) -> Result<Option<UserKey>> {
        Ok(self.credentials.load_credentials()?.map(|c| c.user_key()))
    }

    // ========================================================================
    // Sync pass
    // ========================================================================

    pub fn run_sync(&self, force_full_export: bool) -> SyncOutcome {
        self.run_sync_with_budget(force_full_export, &SyncBudget::unlimited())
    }

    /// Run one pass unless another is active; never blocks on the lock
    pub fn run_sync_with_budget(&self, force_full_export: bool, budget: &SyncBudget) -> SyncOutcome {
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            info!("Sync already running, skipping");
            return SyncOutcome::AlreadyRunning;
        };

        let start = Instant::now();
        let mut outcome = self.run_pass(force_full_export, budget);
        let duration_ms = start.elapsed().as_millis() as u64;

        match &mut outcome {
            SyncOutcome::Completed(stats) => {
                stats.duration_ms = duration_ms;
                info!(
                    "Sync complete: {} uploads, {} records, {} types in {}ms",
                    stats.uploads, stats.records_sent, stats.types_completed, duration_ms
                );
            }
            SyncOutcome::Interrupted(stats) => {
                stats.duration_ms = duration_ms;
                info!("Sync interrupted by budget after {} uploads", stats.uploads);
            }
            SyncOutcome::Deferred(stats) => {
                stats.duration_ms = duration_ms;
                info!(
                    "Sync deferred: {} types wait for uploads still in flight",
                    stats.deferred_types
                );
            }
            SyncOutcome::NotConfigured(reason) => warn!("Sync skipped: {}", reason),
            SyncOutcome::TokenUnavailable => warn!("Sync skipped: access token unavailable"),
            SyncOutcome::AuthFailed => error!("Sync stopped: backend rejected credentials"),
            SyncOutcome::Failed { stage, message } => {
                warn!("Sync failed during {}: {}", stage, message)
            }
            SyncOutcome::AlreadyRunning => {}
        }
        outcome
    }

    fn run_pass(&self, force_full_export: bool, budget: &SyncBudget) -> SyncOutcome {
        let config = self.config();
        if let Err(e) = config.validate() {
            return SyncOutcome::NotConfigured(e.to_string());
        }

        let creds = match self.credentials.load_credentials() {
            Ok(Some(creds)) => creds,
            Ok(None) => return SyncOutcome::NotConfigured(ConfigError::MissingUser.to_string()),
            Err(e) => {
                return SyncOutcome::Failed {
                    stage: SyncStage::Session,
                    message: format!("{:#}", e),
                };
            }
        };

        let tracked = match self.credentials.load_settings() {
            Ok(settings) => settings.tracked_type_ids,
            Err(e) => {
                warn!("Failed to load tracked types: {:#}", e);
                Vec::new()
            }
        };
        if tracked.is_empty() {
            return SyncOutcome::NotConfigured(ConfigError::NoTrackedTypes.to_string());
        }

        if !self.tokens.ensure_fresh_token(&config) {
            return SyncOutcome::TokenUnavailable;
        }

        let mut pass = Pass {
            engine: self,
            endpoint: config.sync_url(&creds.user_id),
            user: creds.user_key(),
            user_id: creds.user_id,
            config,
            budget,
            stats: SyncStats::default(),
        };

        match pass.execute(force_full_export, tracked) {
            Ok(()) => SyncOutcome::Completed(pass.stats),
            Err(PassError::Interrupted) => SyncOutcome::Interrupted(pass.stats),
            Err(PassError::Deferred) => SyncOutcome::Deferred(pass.stats),
            Err(PassError::AuthFailed) => SyncOutcome::AuthFailed,
            Err(PassError::Failed { stage, message }) => SyncOutcome::Failed { stage, message },
        }
    }

    fn notify_progress(&self, type_id: &DataTypeId, sent_count: u64, is_complete: bool) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer.on_type_progress(type_id, sent_count, is_complete);
        }
    }
}

fn apply_settings(mut config: SyncConfig, settings: &PluginSettings) -> SyncConfig {
    if let Some(host) = settings.host.as_deref().filter(|h| !h.trim().is_empty()) {
        config = config.with_host(host);
    }
    if let Some(template) = &settings.endpoint_template {
        config.endpoint_template = Some(template.clone());
    }
    config
}

/// Why a pass stopped early
enum PassError {
    Interrupted,
    Deferred,
    AuthFailed,
    Failed { stage: SyncStage, message: String },
}

fn failed(stage: SyncStage) -> impl Fn(anyhow::Error) -> PassError {
    move |e| PassError::Failed {
        stage,
        message: format!("{:#}", e),
    }
}

fn upload_failed(e: UploadError) -> PassError {
    match e {
        UploadError::Storage(message) => PassError::Failed {
            stage: SyncStage::Commit,
            message,
        },
        other => PassError::Failed {
            stage: SyncStage::Upload,
            message: other.to_string(),
        },
    }
}

/// State of one running pass
struct Pass<'a> {
    engine: &'a SyncEngine,
    config: SyncConfig,
    user_id: String,
    user: UserKey,
    endpoint: String,
    budget: &'a SyncBudget,
    stats: SyncStats,
}

impl Pass<'_> {
    fn execute(&mut self, force_full_export: bool, tracked: Vec<DataTypeId>) -> Result<(), PassError> {
        self.retry_outbox()?;

        let engine = self.engine;
        let sessions = &engine.sessions;
        let mut state = match sessions.load(&self.user) {
            Some(state) if state.has_resumable_progress() => {
                info!(
                    "Resuming sync session at type {} ({} records already sent)",
                    state.resume_index, state.total_sent_count
                );
                self.stats.resumed = true;
                state
            }
            _ => {
                let done = engine
                    .anchors
                    .is_full_export_done(&self.user)
                    .unwrap_or_else(|e| {
                        warn!("Failed to read full export flag, assuming not done: {:#}", e);
                        false
                    });
                sessions
                    .start_new(&self.user, force_full_export || !done, tracked)
                    .map_err(failed(SyncStage::Session))?
            }
        };
        self.stats.full_export = state.is_full_export;

        match self.config.upload_mode {
            UploadMode::PerType => self.run_per_type(&mut state)?,
            UploadMode::Combined => self.run_combined(&mut state)?,
        }
        if self.stats.deferred_types > 0 {
            return Err(PassError::Deferred);
        }

        sessions.finalize(&state).map_err(failed(SyncStage::Finalize))
    }

    fn check_budget(&self) -> Result<(), PassError> {
        if self.budget.is_exhausted() {
            info!("Time budget exhausted; no new work will start");
            return Err(PassError::Interrupted);
        }
        Ok(())
    }

    /// Current `Authorization` value; a sign-out or account switch mid-pass is an auth failure
    fn auth_header(&self) -> Result<String, PassError> {
        match self.engine.credentials.load_credentials() {
            Ok(Some(creds)) if creds.user_id == self.user_id => Ok(creds.access_token),
            Ok(_) => Err(PassError::AuthFailed),
            Err(e) => Err(failed(SyncStage::Upload)(e)),
        }
    }

    fn retry_outbox(&mut self) -> Result<(), PassError> {
        let engine = self.engine;
        let token = self.auth_header()?;
        let report = engine.outbox.retry_pending(
            &self.user,
            &self.endpoint,
            &token,
            engine.transport.as_ref(),
            engine.anchors.as_ref(),
        );
        self.stats.retried_items += report.succeeded + report.recovered;
        if !report.auth_rejected {
            return Ok(());
        }

        if !engine.tokens.force_refresh(&self.config, &token) {
            return Err(PassError::AuthFailed);
        }
        let token = self.auth_header()?;
        let report = engine.outbox.retry_pending(
            &self.user,
            &self.endpoint,
            &token,
            engine.transport.as_ref(),
            engine.anchors.as_ref(),
        );
        self.stats.retried_items += report.succeeded + report.recovered;
        if report.auth_rejected {
            return Err(PassError::AuthFailed);
        }
        Ok(())
    }

    fn committed_cursor(&self, type_id: &DataTypeId) -> Option<Cursor> {
        match self.engine.anchors.get_cursor(&self.user, type_id) {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!("Failed to read cursor for {}, reading from scratch: {:#}", type_id, e);
                None
            }
        }
    }

    fn read_limit(&self) -> Option<usize> {
        self.config.read_limit.filter(|limit| *limit > 0)
    }

    fn read_page(
        &self,
        type_id: &DataTypeId,
        cursor: Option<Cursor>,
        since: Option<DateTime<Utc>>,
    ) -> Result<ReadBatch, PassError> {
        let request = ReadRequest {
            type_id: type_id.clone(),
            since: if cursor.is_none() { since } else { None },
            cursor,
            limit: self.read_limit(),
        };
        self.engine
            .source
            .read_since(&request)
            .map_err(failed(SyncStage::Query))
    }

    /// Whether nothing remains after this page
    fn is_final_page(&self, batch: &ReadBatch, requested: Option<&Cursor>) -> bool {
        let short = self
            .read_limit()
            .is_none_or(|limit| batch.samples.len() < limit);
        let stuck = batch.new_cursor.is_none() || batch.new_cursor.as_ref() == requested;
        short || stuck
    }

    /// Where reads for a type start: nothing in a full export, else the committed cursor
    fn start_position(&self, state: &SyncSessionState, base: &Option<Cursor>) -> Option<Cursor> {
        if state.is_full_export { None } else { base.clone() }
    }

    fn record(
        &mut self,
        state: &mut SyncSessionState,
        type_id: &DataTypeId,
        sent: usize,
        is_complete: bool,
        pending_cursor: Option<Cursor>,
    ) -> Result<(), PassError> {
        self.engine
            .sessions
            .record_type_progress(state, type_id, sent as u64, is_complete, pending_cursor)
            .map_err(failed(SyncStage::Commit))?;
        if is_complete {
            self.stats.types_completed += 1;
        }
        let sent_count = state
            .per_type_progress
            .get(type_id)
            .map_or(0, |p| p.sent_count);
        self.engine.notify_progress(type_id, sent_count, is_complete);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Per-type mode
    // ------------------------------------------------------------------------

    fn run_per_type(&mut self, state: &mut SyncSessionState) -> Result<(), PassError> {
        let mut first_deferred = None;
        for (index, type_id) in state.remaining_types() {
            self.check_budget()?;
            self.engine
                .sessions
                .set_resume_index(state, index)
                .map_err(failed(SyncStage::Session))?;
            if !self.clear_scope(type_id.as_str())? {
                self.stats.deferred_types += 1;
                first_deferred.get_or_insert(index);
                continue;
            }
            self.sync_type(state, &type_id)?;
        }
        // Resume at the first skipped type, not past it
        if let Some(index) = first_deferred {
            self.engine
                .sessions
                .set_resume_index(state, index)
                .map_err(failed(SyncStage::Session))?;
        }
        Ok(())
    }

    /// Supersede stale items of a scope; false when one may still be in flight
    fn clear_scope(&self, scope: &str) -> Result<bool, PassError> {
        let report = self
            .engine
            .outbox
            .supersede(&self.user, scope)
            .map_err(failed(SyncStage::Stage))?;
        if report.kept > 0 {
            info!(
                "{}: {} staged uploads may still be in flight; skipping this pass",
                scope, report.kept
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn sync_type(&mut self, state: &mut SyncSessionState, type_id: &DataTypeId) -> Result<(), PassError> {
        let base = self.committed_cursor(type_id);
        let since = Some(self.config.lookback_start(Utc::now()));
        let mut page_cursor = self.start_position(state, &base);
        let mut sent_any = false;
        let mut pending: Option<Cursor> = None;

        loop {
            if sent_any {
                self.check_budget()?;
            }
            let batch = self.read_page(type_id, page_cursor.clone(), since)?;
            let is_final = self.is_final_page(&batch, page_cursor.as_ref());

            if batch.samples.is_empty() {
                if sent_any {
                    // Trailing empty page after full pages
                    let cursor = batch.new_cursor.or(pending);
                    return self.record(state, type_id, 0, true, cursor);
                }
                debug!("{}: no new samples", type_id);
                return self.record(state, type_id, 0, true, None);
            }

            info!("{}: {} new samples", type_id, batch.samples.len());
            let chunks: Vec<&[Sample]> = batch.samples.chunks(self.config.chunk_size).collect();
            let chunk_count = chunks.len();

            for (i, chunk) in chunks.into_iter().enumerate() {
                if i > 0 {
                    self.check_budget()?;
                }
                let is_last_chunk = i + 1 == chunk_count;
                let commits = is_final && is_last_chunk;

                let cursors = match (&batch.new_cursor, commits) {
                    (Some(cursor), true) => vec![CandidateCursor {
                        type_id: type_id.clone(),
                        base_cursor: base.clone(),
                        cursor: cursor.clone(),
                    }],
                    _ => Vec::new(),
                };

                self.send_chunk(type_id.as_str(), chunk, cursors, state.is_full_export, false)?;
                sent_any = true;

                let page_pending = if is_last_chunk && !commits {
                    batch.new_cursor.clone()
                } else {
                    None
                };
                self.record(state, type_id, chunk.len(), commits, page_pending)?;
            }

            if is_final {
                return Ok(());
            }
            pending = batch.new_cursor.clone();
            page_cursor = batch.new_cursor;
        }
    }

    // ------------------------------------------------------------------------
    // Combined mode
    // ------------------------------------------------------------------------

    /// Bundle one page of every remaining type per round until all are complete
    fn run_combined(&mut self, state: &mut SyncSessionState) -> Result<(), PassError> {
        let mut positions: BTreeMap<DataTypeId, Option<Cursor>> = BTreeMap::new();

        loop {
            let remaining = state.remaining_types();
            let Some((first_index, _)) = remaining.first() else {
                return Ok(());
            };
            self.check_budget()?;
            self.engine
                .sessions
                .set_resume_index(state, *first_index)
                .map_err(failed(SyncStage::Session))?;

            if !self.clear_scope(COMBINED_SCOPE)? {
                self.stats.deferred_types += remaining.len();
                return Ok(());
            }

            let since = Some(self.config.lookback_start(Utc::now()));
            let mut samples: Vec<Sample> = Vec::new();
            let mut cursors = Vec::new();
            // Completed types, with the cursor a trailing empty page commits
            let mut final_types: Vec<(DataTypeId, Option<Cursor>)> = Vec::new();
            let mut all_final = true;

            for (_, type_id) in &remaining {
                let base = self.committed_cursor(type_id);
                let earlier = positions.get(type_id).cloned();
                let start = earlier
                    .clone()
                    .unwrap_or_else(|| self.start_position(state, &base));
                let batch = self.read_page(type_id, start.clone(), since)?;
                let is_final = self.is_final_page(&batch, start.as_ref());

                // Only a type's last page may move its anchor; earlier pages
                // stay in `positions` so a failed round cannot skip data
                if is_final {
                    let last = batch.new_cursor.clone().or(start.clone());
                    match (batch.samples.is_empty(), last) {
                        (false, Some(cursor)) => {
                            cursors.push(CandidateCursor {
                                type_id: type_id.clone(),
                                base_cursor: base,
                                cursor,
                            });
                            final_types.push((type_id.clone(), None));
                        }
                        (true, Some(cursor)) if earlier.is_some() => {
                            final_types.push((type_id.clone(), Some(cursor)));
                        }
                        _ => final_types.push((type_id.clone(), None)),
                    }
                } else {
                    all_final = false;
                    if batch.new_cursor.is_some() {
                        positions.insert(type_id.clone(), batch.new_cursor);
                    }
                }
                samples.extend(batch.samples);
            }

            info!(
                "Combined round: {} samples across {} types",
                samples.len(),
                remaining.len()
            );

            let chunks: Vec<&[Sample]> = samples.chunks(self.config.chunk_size).collect();
            let chunk_count = chunks.len();
            let mut candidates = Some(cursors);

            for (i, chunk) in chunks.into_iter().enumerate() {
                if i > 0 {
                    self.check_budget()?;
                }
                let is_last_chunk = i + 1 == chunk_count;
                let chunk_cursors = if is_last_chunk {
                    candidates.take().unwrap_or_default()
                } else {
                    Vec::new()
                };
                let completes = is_last_chunk && state.is_full_export && all_final;

                self.send_chunk(COMBINED_SCOPE, chunk, chunk_cursors, state.is_full_export, completes)?;

                let mut per_type: BTreeMap<DataTypeId, usize> = BTreeMap::new();
                for sample in chunk {
                    *per_type.entry(sample.type_id.clone()).or_default() += 1;
                }
                for (type_id, count) in per_type {
                    self.record(state, &type_id, count, false, None)?;
                }
            }

            for (type_id, delivered) in final_types {
                self.record(state, &type_id, 0, true, delivered)?;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------------

    fn send_chunk(
        &mut self,
        scope: &str,
        samples: &[Sample],
        cursors: Vec<CandidateCursor>,
        was_full_export: bool,
        completes_full_export: bool,
    ) -> Result<(), PassError> {
        let payload = build_payload(samples);
        let body = payload
            .to_json_bytes()
            .map_err(|e| failed(SyncStage::Stage)(e.into()))?;

        let item = self
            .engine
            .outbox
            .stage(NewOutboxItem {
                scope: scope.to_string(),
                user_key: self.user.clone(),
                body,
                record_count: payload.record_count(),
                cursors,
                was_full_export,
                completes_full_export,
            })
            .map_err(failed(SyncStage::Stage))?;

        let result = self.upload_item(&item)?;
        if !result.committed_types.is_empty() {
            debug!("Committed cursors for {:?}", result.committed_types);
        }
        self.stats.uploads += 1;
        self.stats.records_sent += item.record_count;
        Ok(())
    }

    /// Upload a staged item, refreshing the token and retrying once on a 401
    fn upload_item(&self, item: &OutboxItem) -> Result<UploadResult, PassError> {
        let engine = self.engine;
        let token = self.auth_header()?;
        let attempt = |token: &str| {
            engine.outbox.upload(
                item,
                &self.endpoint,
                token,
                engine.transport.as_ref(),
                engine.anchors.as_ref(),
            )
        };

        match attempt(&token) {
            Ok(result) => Ok(result),
            Err(e) if e.is_auth() => {
                warn!("Upload {} rejected with 401; refreshing token", item.id);
                if !engine.tokens.force_refresh(&self.config, &token) {
                    return Err(PassError::AuthFailed);
                }
                let token = self.auth_header()?;
                attempt(&token).map_err(|e| {
                    if e.is_auth() {
                        PassError::AuthFailed
                    } else {
                        upload_failed(e)
                    }
                })
            }
            Err(e) => Err(upload_failed(e)),
        }
    }
}
