//! Resumable session lifecycle
//!
//! `NONE -> ACTIVE -> [per type: QUERYING -> UPLOADING -> COMMITTED]* -> FINALIZED -> NONE`
//!
//! Every mutation is persisted before returning, so a process killed at any
//! point reloads into `ACTIVE` with completed types skipped.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;

use crate::models::{Cursor, DataTypeId, SyncSessionState, UserKey};
use crate::storage::{AnchorStore, SessionStore};

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    anchors: Arc<dyn AnchorStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, anchors: Arc<dyn AnchorStore>) -> Self {
        Self { store, anchors }
    }

    /// Load the session for `user`
    ///
    /// State saved for another user, or that fails to parse, is deleted and
    /// reported as absent. Storage errors are also reported as absent so a
    /// pass can always start.
    pub fn load(&self, user: &UserKey) -> Option<SyncSessionState> {
        let (owner, data) = match self.store.load_session() {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read sync session, starting fresh: {:#}", e);
                return None;
            }
        };

        if &owner != user {
            info!("Discarding sync session saved for a different user");
            self.discard();
            return None;
        }

        match serde_json::from_str::<SyncSessionState>(&data) {
            Ok(state) if &state.user_key == user => Some(state),
            Ok(_) => {
                info!("Discarding sync session with mismatched user key");
                self.discard();
                None
            }
            Err(e) => {
                warn!("Discarding corrupt sync session: {}", e);
                self.discard();
                None
            }
        }
    }

    fn discard(&self) {
        if let Err(e) = self.store.delete_session() {
            warn!("Failed to delete stale sync session: {:#}", e);
        }
    }

    /// Start and persist a fresh session, replacing any prior state
    pub fn start_new(
        &self,
        user: &UserKey,
        is_full_export: bool,
        ordered_type_ids: Vec<DataTypeId>,
    ) -> Result<SyncSessionState> {
        let state = SyncSessionState::new(user.clone(), is_full_export, ordered_type_ids);
        self.save(&state)?;
        info!(
            "Started {} sync session for {} types",
            if is_full_export { "full export" } else { "incremental" },
            state.ordered_type_ids.len()
        );
        Ok(state)
    }

    /// Record delivered records for a type
    ///
    /// When `is_complete`, the pending cursor is committed to the anchor
    /// store before the session is saved, so the cursor never stays pending
    /// past the type's completion.
    pub fn record_type_progress(
        &self,
        state: &mut SyncSessionState,
        type_id: &DataTypeId,
        sent_delta: u64,
        is_complete: bool,
        pending_cursor: Option<Cursor>,
    ) -> Result<()> {
        if is_complete && let Some(cursor) = &pending_cursor {
            self.anchors
                .set_cursor(&state.user_key, type_id, cursor)
                .with_context(|| format!("Failed to commit cursor for {}", type_id))?;
        }

        let completed = state.apply_progress(type_id, sent_delta, is_complete, pending_cursor);
        if completed {
            debug!(
                "Type {} complete ({} records this session)",
                type_id,
                state
                    .per_type_progress
                    .get(type_id)
                    .map_or(0, |p| p.sent_count)
            );
        }
        self.save(state)
    }

    /// Record the type index to continue from after a restart
    pub fn set_resume_index(&self, state: &mut SyncSessionState, index: usize) -> Result<()> {
        if state.resume_index == index {
            return Ok(());
        }
        state.resume_index = index;
        self.save(state)
    }

    /// Close the session: set the full-export flag if applicable, then delete it
    pub fn finalize(&self, state: &SyncSessionState) -> Result<()> {
        if state.is_full_export {
            self.anchors
                .set_full_export_done(&state.user_key, true)
                .context("Failed to set full export flag")?;
        }
        self.store
            .delete_session()
            .context("Failed to delete finalized sync session")?;
        info!(
            "Finalized sync session: {} records across {} types",
            state.total_sent_count,
            state.completed_type_ids.len()
        );
        Ok(())
    }

    /// Whether a pass for `user` must resume instead of starting fresh
    pub fn has_resumable_progress(&self, user: &UserKey) -> bool {
        self.load(user)
            .is_some_and(|state| state.has_resumable_progress())
    }

    /// Drop any stored session
    pub fn clear(&self) -> Result<()> {
        self.store.delete_session()
    }

    fn save(&self, state: &SyncSessionState) -> Result<()> {
        let data = serde_json::to_string(state).context("Failed to serialize sync session")?;
        self.store
            .save_session(&state.user_key, &data)
            .context("Failed to persist sync session")
    }
}
