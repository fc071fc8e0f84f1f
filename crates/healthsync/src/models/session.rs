//! Resumable sync session state
//!
//! Persisted separately from anchors so an interrupted pass can continue
//! after the process is killed. At most one session exists per user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{Cursor, DataTypeId, UserKey};

/// Progress of a single data type within a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeProgress {
    /// Records delivered for this type during the session
    pub sent_count: u64,
    pub is_complete: bool,
    /// Cursor read but not yet committed to the anchor store
    pub pending_cursor: Option<Cursor>,
}

/// In-progress sync pass for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSessionState {
    pub user_key: UserKey,
    pub is_full_export: bool,
    pub created_at: DateTime<Utc>,
    /// Type order fixed at session start; `resume_index` points into it
    pub ordered_type_ids: Vec<DataTypeId>,
    #[serde(default)]
    pub per_type_progress: BTreeMap<DataTypeId, TypeProgress>,
    #[serde(default)]
    pub total_sent_count: u64,
    #[serde(default)]
    pub completed_type_ids: BTreeSet<DataTypeId>,
    #[serde(default)]
    pub resume_index: usize,
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl SyncSessionState {
    /// Create a fresh session at index 0 with no progress
    pub fn new(user_key: UserKey, is_full_export: bool, ordered_type_ids: Vec<DataTypeId>) -> Self {
        Self {
            user_key,
            is_full_export,
            created_at: Utc::now(),
            ordered_type_ids,
            per_type_progress: BTreeMap::new(),
            total_sent_count: 0,
            completed_type_ids: BTreeSet::new(),
            resume_index: 0,
            version: default_version(),
        }
    }

    /// A session with delivered records or completed types must be resumed
    pub fn has_resumable_progress(&self) -> bool {
        self.total_sent_count > 0 || !self.completed_type_ids.is_empty()
    }

    pub fn is_type_complete(&self, type_id: &DataTypeId) -> bool {
        self.completed_type_ids.contains(type_id)
    }

    /// Every tracked type has been marked complete
    pub fn all_types_complete(&self) -> bool {
        self.ordered_type_ids
            .iter()
            .all(|t| self.completed_type_ids.contains(t))
    }

    /// Types still to process, in order, starting at `resume_index`
    pub fn remaining_types(&self) -> Vec<(usize, DataTypeId)> {
        self.ordered_type_ids
            .iter()
            .enumerate()
            .skip(self.resume_index)
            .filter(|(_, t)| !self.completed_type_ids.contains(*t))
            .map(|(i, t)| (i, t.clone()))
            .collect()
    }

    /// Apply progress for a type; returns true when the type became complete
    pub(crate) fn apply_progress(
        &mut self,
        type_id: &DataTypeId,
        sent_delta: u64,
        is_complete: bool,
        pending_cursor: Option<Cursor>,
    ) -> bool {
        let progress = self.per_type_progress.entry(type_id.clone()).or_default();
        progress.sent_count = progress.sent_count.saturating_add(sent_delta);
        if pending_cursor.is_some() {
            progress.pending_cursor = pending_cursor;
        }
        self.total_sent_count = self.total_sent_count.saturating_add(sent_delta);

        if is_complete && !progress.is_complete {
            progress.is_complete = true;
            progress.pending_cursor = None;
            self.completed_type_ids.insert(type_id.clone());
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(ids: &[&str]) -> Vec<DataTypeId> {
        ids.iter().map(|id| DataTypeId::new(*id)).collect()
    }

    #[test]
    fn test_new_session_is_not_resumable() {
        let state = SyncSessionState::new(UserKey::new("u"), true, types(&["steps"]));
        assert!(!state.has_resumable_progress());
        assert_eq!(state.resume_index, 0);
    }

    #[test]
    fn test_sent_records_make_session_resumable() {
        let mut state = SyncSessionState::new(UserKey::new("u"), false, types(&["steps"]));
        let completed = state.apply_progress(&DataTypeId::new("steps"), 10, false, None);
        assert!(!completed);
        assert!(state.has_resumable_progress());
        assert_eq!(state.total_sent_count, 10);
    }

    #[test]
    fn test_completed_type_without_records_is_resumable() {
        let mut state = SyncSessionState::new(UserKey::new("u"), false, types(&["steps", "sleep"]));
        let completed = state.apply_progress(&DataTypeId::new("steps"), 0, true, None);
        assert!(completed);
        assert!(state.has_resumable_progress());
        assert!(!state.all_types_complete());
    }

    #[test]
    fn test_remaining_types_skips_completed_and_resume_index() {
        let mut state =
            SyncSessionState::new(UserKey::new("u"), false, types(&["a", "b", "c", "d"]));
        state.apply_progress(&DataTypeId::new("a"), 1, true, None);
        state.apply_progress(&DataTypeId::new("b"), 1, true, None);
        state.apply_progress(&DataTypeId::new("d"), 1, true, None);
        state.resume_index = 2;

        let remaining = state.remaining_types();
        assert_eq!(remaining, vec![(2, DataTypeId::new("c"))]);
    }

    #[test]
    fn test_completion_clears_pending_cursor() {
        let mut state = SyncSessionState::new(UserKey::new("u"), false, types(&["steps"]));
        let steps = DataTypeId::new("steps");
        state.apply_progress(&steps, 5, false, Some(Cursor::new("c1")));
        assert_eq!(
            state.per_type_progress[&steps].pending_cursor,
            Some(Cursor::new("c1"))
        );

        state.apply_progress(&steps, 5, true, Some(Cursor::new("c2")));
        assert!(state.per_type_progress[&steps].pending_cursor.is_none());
        assert_eq!(state.per_type_progress[&steps].sent_count, 10);
        assert!(state.all_types_complete());
    }

    #[test]
    fn test_serialization_tolerates_missing_fields() {
        let json = r#"{
            "user_key": "user:1",
            "is_full_export": true,
            "created_at": "2024-01-01T00:00:00Z",
            "ordered_type_ids": ["steps"]
        }"#;
        let state: SyncSessionState = serde_json::from_str(json).unwrap();
        assert_eq!(state.version, 1);
        assert!(state.completed_type_ids.is_empty());
    }
}
