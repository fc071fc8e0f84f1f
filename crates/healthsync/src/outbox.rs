//! Durable upload staging (the outbox)
//!
//! Every upload is written to disk before the network call starts, so a
//! process killed mid-request leaves enough behind to retry the request and
//! commit its cursors later.
//!
//! Directory structure:
//! ```text
//! outbox/
//!   0190a5c2-...-7f3e.payload.zst     # zstd-compressed request body
//!   0190a5c2-...-7f3e.cursors.json    # candidate cursors to commit on 2xx
//!   0190a5c2-...-7f3e.manifest.json   # item metadata, written last
//!   0190a5c2-...-7f3e.acked           # backend returned 2xx, commit pending
//! ```
//!
//! An item exists once its manifest exists. Files without a manifest are
//! leftovers of an interrupted `stage` and are removed after the grace window.
//! An acknowledged item is never sent again; the next scan only commits it.

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{HttpRequest, HttpTransport};
use crate::error::UploadError;
use crate::models::{Cursor, DataTypeId, UserKey};
use crate::storage::AnchorStore;
use crate::sync::timing::window_elapsed;

/// Scope of items bundling several data types
pub const COMBINED_SCOPE: &str = "combined";

const PAYLOAD_SUFFIX: &str = ".payload.zst";
const CURSORS_SUFFIX: &str = ".cursors.json";
const MANIFEST_SUFFIX: &str = ".manifest.json";
const ACK_SUFFIX: &str = ".acked";

/// Cursor to commit for one type once an item is acknowledged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateCursor {
    pub type_id: DataTypeId,
    /// Anchor the samples were queried from; the commit is skipped if the
    /// anchor has moved since
    pub base_cursor: Option<Cursor>,
    pub cursor: Cursor,
}

/// Manifest of a staged upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: String,
    /// Data type id, or [`COMBINED_SCOPE`]
    pub scope: String,
    pub user_key: UserKey,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    /// Staged during a full-export pass
    pub was_full_export: bool,
    /// Acknowledging this item completes the user's full export
    pub completes_full_export: bool,
    pub payload_file: String,
    pub cursor_file: String,
}

impl OutboxItem {
    pub fn is_combined(&self) -> bool {
        self.scope == COMBINED_SCOPE
    }
}

/// Everything needed to stage one upload
#[derive(Debug, Clone)]
pub struct NewOutboxItem {
    pub scope: String,
    pub user_key: UserKey,
    pub body: Vec<u8>,
    pub record_count: usize,
    pub cursors: Vec<CandidateCursor>,
    pub was_full_export: bool,
    pub completes_full_export: bool,
}

/// Accepted upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResult {
    pub http_status: u16,
    pub body: String,
    /// Types whose cursor was committed by this acknowledgement
    pub committed_types: Vec<DataTypeId>,
}

/// Outcome of a `retry_pending` scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Younger than the grace window; possibly still in flight
    pub skipped_in_grace: usize,
    /// Already acknowledged; committed without sending again
    pub recovered: usize,
    /// The scan stopped at a 401
    pub auth_rejected: bool,
}

/// Outcome of a `supersede` call
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SupersedeReport {
    pub removed: usize,
    /// Left in place: inside the grace window or acknowledged
    pub kept: usize,
}

pub struct Outbox {
    dir: PathBuf,
    grace_secs: u64,
    compression_level: i32,
    /// Items whose upload failed in this process, so nothing else is sending them
    settled: Mutex<HashSet<String>>,
}

impl Outbox {
    /// Open (or create) an outbox directory
    pub fn new(dir: impl AsRef<Path>, grace_secs: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("Failed to create outbox directory")?;
        Ok(Self {
            dir,
            grace_secs,
            compression_level: 3,
            settled: Mutex::new(HashSet::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, MANIFEST_SUFFIX))
    }

    fn ack_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, ACK_SUFFIX))
    }

    /// The backend accepted this item but its commit has not finished
    pub fn is_acknowledged(&self, item: &OutboxItem) -> bool {
        self.ack_path(&item.id).exists()
    }

    fn mark_acknowledged(&self, item: &OutboxItem) -> Result<()> {
        fs::write(self.ack_path(&item.id), b"")
            .with_context(|| format!("Failed to mark outbox item {} acknowledged", item.id))
    }

    fn mark_settled(&self, item: &OutboxItem) {
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item.id.clone());
    }

    /// Whether another sender may still be uploading this item
    fn may_be_in_flight(&self, item: &OutboxItem, now: DateTime<Utc>) -> bool {
        let settled = self
            .settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&item.id);
        !settled && !window_elapsed(Some(item.created_at), self.grace_secs, now)
    }

    /// Write payload, cursors, then manifest; nothing is sent yet
    pub fn stage(&self, new: NewOutboxItem) -> Result<OutboxItem> {
        let id = Uuid::now_v7().to_string();
        let payload_file = format!("{}{}", id, PAYLOAD_SUFFIX);
        let cursor_file = format!("{}{}", id, CURSORS_SUFFIX);

        let compressed = zstd::encode_all(new.body.as_slice(), self.compression_level)
            .context("Failed to compress outbox payload")?;
        let payload_path = self.dir.join(&payload_file);
        let temp_path = payload_path.with_extension("tmp");
        fs::write(&temp_path, &compressed)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, &payload_path)
            .with_context(|| format!("Failed to move {}", payload_path.display()))?;

        ::config::save_json_file(&self.dir.join(&cursor_file), &new.cursors)?;

        let item = OutboxItem {
            id,
            scope: new.scope,
            user_key: new.user_key,
            created_at: Utc::now(),
            record_count: new.record_count,
            was_full_export: new.was_full_export,
            completes_full_export: new.completes_full_export,
            payload_file,
            cursor_file,
        };
        ::config::save_json_file(&self.manifest_path(&item.id), &item)?;

        debug!(
            "Staged outbox item {} ({}, {} records, {} cursors)",
            item.id,
            item.scope,
            item.record_count,
            new.cursors.len()
        );
        Ok(item)
    }

    /// Decompressed request body of an item
    pub fn read_payload(&self, item: &OutboxItem) -> Result<Vec<u8>> {
        let compressed = fs::read(self.dir.join(&item.payload_file))
            .with_context(|| format!("Failed to read payload of outbox item {}", item.id))?;
        let mut decoder = zstd::Decoder::new(compressed.as_slice())?;
        let mut body = Vec::new();
        decoder
            .read_to_end(&mut body)
            .context("Failed to decompress outbox payload")?;
        Ok(body)
    }

    pub fn read_cursors(&self, item: &OutboxItem) -> Result<Vec<CandidateCursor>> {
        ::config::load_json_file(&self.dir.join(&item.cursor_file))
    }

    /// POST a staged item; on 2xx commit its cursors and delete its files
    ///
    /// On any failure the staged files are kept for a later retry.
    pub fn upload(
        &self,
        item: &OutboxItem,
        endpoint: &str,
        auth_header: &str,
        transport: &dyn HttpTransport,
        anchors: &dyn AnchorStore,
    ) -> Result<UploadResult, UploadError> {
        let body = self
            .read_payload(item)
            .map_err(|e| UploadError::Storage(format!("{:#}", e)))?;

        let request = HttpRequest::json(endpoint, body, Some(auth_header));
        let response = match transport.post(&request) {
            Ok(response) => response,
            Err(e) => {
                self.mark_settled(item);
                return Err(UploadError::Transport(format!("{:#}", e)));
            }
        };

        info!(
            "Upload {} ({}, {} records) -> HTTP {}",
            item.id, item.scope, item.record_count, response.status
        );

        if !response.is_success() {
            self.mark_settled(item);
            return Err(UploadError::Status {
                status: response.status,
                body: response.body,
            });
        }

        let committed_types = self
            .finish(item, anchors)
            .map_err(|e| UploadError::Storage(format!("{:#}", e)))?;

        Ok(UploadResult {
            http_status: response.status,
            body: response.body,
            committed_types,
        })
    }

    /// Record the acknowledgement, commit, then delete the item
    ///
    /// If the commit fails the marker stays, and the next scan commits the
    /// item without sending it again.
    fn finish(&self, item: &OutboxItem, anchors: &dyn AnchorStore) -> Result<Vec<DataTypeId>> {
        if !self.is_acknowledged(item) {
            self.mark_acknowledged(item)?;
        }
        let committed = self.commit(item, anchors)?;
        self.remove(item)?;
        Ok(committed)
    }

    /// Apply an acknowledged item's cursors and full-export flag
    fn commit(&self, item: &OutboxItem, anchors: &dyn AnchorStore) -> Result<Vec<DataTypeId>> {
        let cursors = self.read_cursors(item)?;
        let mut committed = Vec::new();

        for candidate in cursors {
            let written = anchors.compare_and_set_cursor(
                &item.user_key,
                &candidate.type_id,
                candidate.base_cursor.as_ref(),
                &candidate.cursor,
            )?;
            if written {
                committed.push(candidate.type_id);
            } else {
                warn!(
                    "Anchor for {} moved since item {} was staged; keeping newer cursor",
                    candidate.type_id, item.id
                );
            }
        }

        if item.completes_full_export {
            anchors.set_full_export_done(&item.user_key, true)?;
            info!("Full export complete for {}", item.user_key);
        }

        Ok(committed)
    }

    /// Staged item with the given id
    pub fn find(&self, id: &str) -> Result<Option<OutboxItem>> {
        if Uuid::parse_str(id).is_err() {
            bail!("Invalid outbox item id {:?}", id);
        }
        ::config::load_json_file_if_exists(&self.manifest_path(id))
    }

    /// Apply the status of an upload the platform sent outside a pass
    ///
    /// A 2xx commits the item like [`Outbox::upload`] does. Any other status
    /// keeps the item for `retry_pending`. Returns `None` when the item is no
    /// longer staged (already retried or superseded) or was not accepted.
    pub fn complete_external(
        &self,
        id: &str,
        http_status: u16,
        anchors: &dyn AnchorStore,
    ) -> Result<Option<Vec<DataTypeId>>> {
        let Some(item) = self.find(id)? else {
            debug!("Outbox item {} already resolved", id);
            return Ok(None);
        };
        if !(200..300).contains(&http_status) {
            warn!(
                "Background upload {} finished with HTTP {}; keeping it for retry",
                id, http_status
            );
            return Ok(None);
        }

        let committed = self.finish(&item, anchors)?;
        info!("Background upload {} accepted", id);
        Ok(Some(committed))
    }

    /// Retry the user's leftover items older than the grace window
    ///
    /// Items are replayed in staging order. Acknowledged items are committed
    /// without a request, whatever their age. The scan stops at the first 401
    /// so the caller can refresh the token and call again.
    pub fn retry_pending(
        &self,
        user: &UserKey,
        endpoint: &str,
        auth_header: &str,
        transport: &dyn HttpTransport,
        anchors: &dyn AnchorStore,
    ) -> RetryReport {
        let mut report = RetryReport::default();
        let now = Utc::now();

        self.remove_orphans(now);

        let items = match self.pending_for_user(user) {
            Ok(items) => items,
            Err(e) => {
                warn!("Failed to scan outbox: {:#}", e);
                return report;
            }
        };

        for item in items {
            if self.is_acknowledged(&item) {
                match self.finish(&item, anchors) {
                    Ok(_) => {
                        debug!("Committed acknowledged outbox item {}", item.id);
                        report.recovered += 1;
                    }
                    Err(e) => warn!("Commit of acknowledged item {} failed: {:#}", item.id, e),
                }
                continue;
            }
            if !window_elapsed(Some(item.created_at), self.grace_secs, now) {
                report.skipped_in_grace += 1;
                continue;
            }

            report.attempted += 1;
            match self.upload(&item, endpoint, auth_header, transport, anchors) {
                Ok(_) => report.succeeded += 1,
                Err(e) if e.is_auth() => {
                    report.failed += 1;
                    report.auth_rejected = true;
                    break;
                }
                Err(e) => {
                    warn!("Retry of outbox item {} failed: {}", item.id, e);
                    report.failed += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                "Outbox retry: {} attempted, {} succeeded, {} failed",
                report.attempted, report.succeeded, report.failed
            );
        }
        report
    }

    /// All items, oldest first
    ///
    /// Unreadable manifests are removed together with their files.
    pub fn pending_items(&self) -> Result<Vec<OutboxItem>> {
        let mut items = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(id) = name.strip_suffix(MANIFEST_SUFFIX) else {
                continue;
            };

            match ::config::load_json_file::<OutboxItem>(&entry.path()) {
                Ok(item) if self.dir.join(&item.payload_file).exists() => items.push(item),
                Ok(item) => {
                    warn!("Outbox item {} lost its payload; dropping it", item.id);
                    self.remove(&item).ok();
                }
                Err(e) => {
                    warn!("Dropping unreadable outbox manifest {}: {:#}", name, e);
                    self.remove_files_for(id);
                }
            }
        }

        // UUIDv7 ids sort by creation time
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    pub fn pending_for_user(&self, user: &UserKey) -> Result<Vec<OutboxItem>> {
        Ok(self
            .pending_items()?
            .into_iter()
            .filter(|item| &item.user_key == user)
            .collect())
    }

    pub fn count_for_user(&self, user: &UserKey) -> Result<usize> {
        Ok(self.pending_for_user(user)?.len())
    }

    /// Delete un-acknowledged items for (user, scope) before a re-query stages new ones
    ///
    /// Items another sender may still be uploading are kept, as are
    /// acknowledged ones; the caller must not re-query the scope while any
    /// are kept.
    pub fn supersede(&self, user: &UserKey, scope: &str) -> Result<SupersedeReport> {
        let now = Utc::now();
        let mut report = SupersedeReport::default();

        for item in self.pending_for_user(user)? {
            if item.scope != scope {
                continue;
            }
            if self.is_acknowledged(&item) || self.may_be_in_flight(&item, now) {
                report.kept += 1;
                continue;
            }
            self.remove(&item)?;
            report.removed += 1;
        }

        if report.removed > 0 {
            info!("Superseded {} stale outbox items for {}", report.removed, scope);
        }
        Ok(report)
    }

    /// Delete every item belonging to a user
    pub fn clear_user(&self, user: &UserKey) -> Result<usize> {
        let items = self.pending_for_user(user)?;
        for item in &items {
            self.remove(item)?;
        }
        Ok(items.len())
    }

    /// Delete an item's files, manifest first
    pub fn remove(&self, item: &OutboxItem) -> Result<()> {
        for path in [
            self.manifest_path(&item.id),
            self.dir.join(&item.payload_file),
            self.dir.join(&item.cursor_file),
            self.ack_path(&item.id),
        ] {
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&item.id);
        Ok(())
    }

    fn remove_files_for(&self, id: &str) {
        for suffix in [MANIFEST_SUFFIX, PAYLOAD_SUFFIX, CURSORS_SUFFIX, ACK_SUFFIX] {
            fs::remove_file(self.dir.join(format!("{}{}", id, suffix))).ok();
        }
    }

    /// Remove files left by a `stage` that died before writing its manifest
    fn remove_orphans(&self, now: DateTime<Utc>) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(MANIFEST_SUFFIX) {
                continue;
            }
            let id = name.split('.').next().unwrap_or_default();
            if self.manifest_path(id).exists() {
                continue;
            }

            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            if window_elapsed(modified, self.grace_secs, now) {
                debug!("Removing orphaned outbox file {}", name);
                fs::remove_file(&path).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockTransport;
    use crate::storage::InMemorySyncStore;
    use tempfile::tempdir;

    const ENDPOINT: &str = "https://api.example.com/api/v1/sdk/users/u1/sync/apple";

    fn user() -> UserKey {
        UserKey::for_user("u1")
    }

    fn new_item(scope: &str, cursors: Vec<CandidateCursor>) -> NewOutboxItem {
        NewOutboxItem {
            scope: scope.to_string(),
            user_key: user(),
            body: br#"{"data":{"records":[],"workouts":[],"sleep":[]}}"#.to_vec(),
            record_count: 0,
            cursors,
            was_full_export: false,
            completes_full_export: false,
        }
    }

    fn candidate(type_id: &str, base: Option<&str>, cursor: &str) -> CandidateCursor {
        CandidateCursor {
            type_id: DataTypeId::new(type_id),
            base_cursor: base.map(Cursor::new),
            cursor: Cursor::new(cursor),
        }
    }

    #[test]
    fn test_stage_writes_all_files() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 30).unwrap();

        let item = outbox
            .stage(new_item("steps", vec![candidate("steps", None, "10")]))
            .unwrap();

        assert!(dir.path().join(&item.payload_file).exists());
        assert!(dir.path().join(&item.cursor_file).exists());
        assert!(outbox.manifest_path(&item.id).exists());
        assert!(outbox.read_payload(&item).unwrap().starts_with(b"{\"data\""));
        assert_eq!(outbox.pending_items().unwrap(), vec![item]);
    }

    #[test]
    fn test_successful_upload_commits_and_cleans_up() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 30).unwrap();
        let anchors = InMemorySyncStore::new();
        let transport = MockTransport::new();

        let item = outbox
            .stage(new_item("steps", vec![candidate("steps", None, "10")]))
            .unwrap();
        let result = outbox
            .upload(&item, ENDPOINT, "Bearer t", &transport, &anchors)
            .unwrap();

        assert_eq!(result.committed_types, vec![DataTypeId::new("steps")]);
        assert_eq!(
            anchors.get_cursor(&user(), &DataTypeId::new("steps")).unwrap(),
            Some(Cursor::new("10"))
        );
        assert!(outbox.pending_items().unwrap().is_empty());

        let sent = transport.requests();
        assert_eq!(sent[0].header("Authorization"), Some("Bearer t"));
        assert_eq!(sent[0].url, ENDPOINT);
    }

    #[test]
    fn test_failed_upload_keeps_files() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 30).unwrap();
        let anchors = InMemorySyncStore::new();
        let transport = MockTransport::new();
        transport.queue_response(503, "unavailable");

        let item = outbox
            .stage(new_item("steps", vec![candidate("steps", None, "10")]))
            .unwrap();
        let err = outbox
            .upload(&item, ENDPOINT, "Bearer t", &transport, &anchors)
            .unwrap_err();

        assert_eq!(err.status(), Some(503));
        assert!(anchors.get_cursor(&user(), &DataTypeId::new("steps")).unwrap().is_none());
        assert_eq!(outbox.pending_items().unwrap().len(), 1);
    }

    #[test]
    fn test_commit_skips_moved_anchor() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 30).unwrap();
        let anchors = InMemorySyncStore::new();
        let steps = DataTypeId::new("steps");
        anchors.set_cursor(&user(), &steps, &Cursor::new("50")).unwrap();

        // Staged from an older anchor; must not move the cursor back
        let item = outbox
            .stage(new_item("steps", vec![candidate("steps", Some("5"), "10")]))
            .unwrap();
        let result = outbox
            .upload(&item, ENDPOINT, "Bearer t", &MockTransport::new(), &anchors)
            .unwrap();

        assert!(result.committed_types.is_empty());
        assert_eq!(anchors.get_cursor(&user(), &steps).unwrap(), Some(Cursor::new("50")));
    }

    #[test]
    fn test_completes_full_export_sets_flag() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 30).unwrap();
        let anchors = InMemorySyncStore::new();

        let mut new = new_item(COMBINED_SCOPE, vec![]);
        new.was_full_export = true;
        new.completes_full_export = true;
        let item = outbox.stage(new).unwrap();
        assert!(item.is_combined());

        outbox
            .upload(&item, ENDPOINT, "Bearer t", &MockTransport::new(), &anchors)
            .unwrap();
        assert!(anchors.is_full_export_done(&user()).unwrap());
    }

    #[test]
    fn test_external_completion() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 30).unwrap();
        let anchors = InMemorySyncStore::new();
        let item = outbox
            .stage(new_item("steps", vec![candidate("steps", None, "4")]))
            .unwrap();

        assert_eq!(outbox.complete_external(&item.id, 503, &anchors).unwrap(), None);
        assert_eq!(outbox.find(&item.id).unwrap(), Some(item.clone()));

        let committed = outbox.complete_external(&item.id, 201, &anchors).unwrap();
        assert_eq!(committed, Some(vec![DataTypeId::new("steps")]));
        assert!(outbox.find(&item.id).unwrap().is_none());

        // A late duplicate report is ignored
        assert_eq!(outbox.complete_external(&item.id, 200, &anchors).unwrap(), None);
        assert!(outbox.find("../credentials").is_err());
    }

    #[test]
    fn test_retry_respects_grace_window() {
        let dir = tempdir().unwrap();
        let anchors = InMemorySyncStore::new();
        let transport = MockTransport::new();

        let waiting = Outbox::new(dir.path(), 3600).unwrap();
        waiting.stage(new_item("steps", vec![])).unwrap();
        let report = waiting.retry_pending(&user(), ENDPOINT, "Bearer t", &transport, &anchors);
        assert_eq!(report.skipped_in_grace, 1);
        assert_eq!(report.attempted, 0);
        assert_eq!(transport.request_count(), 0);

        let eager = Outbox::new(dir.path(), 0).unwrap();
        let report = eager.retry_pending(&user(), ENDPOINT, "Bearer t", &transport, &anchors);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert!(eager.pending_items().unwrap().is_empty());
    }

    #[test]
    fn test_retry_stops_on_401() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 0).unwrap();
        let anchors = InMemorySyncStore::new();
        let transport = MockTransport::new();
        transport.queue_response(401, "expired");

        outbox.stage(new_item("steps", vec![])).unwrap();
        outbox.stage(new_item("heartRate", vec![])).unwrap();

        let report = outbox.retry_pending(&user(), ENDPOINT, "Bearer t", &transport, &anchors);
        assert!(report.auth_rejected);
        assert_eq!(report.attempted, 1);
        assert_eq!(outbox.pending_items().unwrap().len(), 2);
    }

    #[test]
    fn test_retry_ignores_other_users() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 0).unwrap();
        let anchors = InMemorySyncStore::new();
        let transport = MockTransport::new();

        let mut other = new_item("steps", vec![]);
        other.user_key = UserKey::for_user("someone-else");
        outbox.stage(other).unwrap();

        let report = outbox.retry_pending(&user(), ENDPOINT, "Bearer t", &transport, &anchors);
        assert_eq!(report.attempted, 0);
        assert_eq!(outbox.pending_items().unwrap().len(), 1);
    }

    #[test]
    fn test_supersede_and_clear_user() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 0).unwrap();
        outbox.stage(new_item("steps", vec![])).unwrap();
        outbox.stage(new_item("steps", vec![])).unwrap();
        outbox.stage(new_item("sleep", vec![])).unwrap();

        let report = outbox.supersede(&user(), "steps").unwrap();
        assert_eq!(report, SupersedeReport { removed: 2, kept: 0 });
        assert_eq!(outbox.count_for_user(&user()).unwrap(), 1);

        assert_eq!(outbox.clear_user(&user()).unwrap(), 1);
        assert!(outbox.pending_items().unwrap().is_empty());
    }

    #[test]
    fn test_supersede_keeps_items_possibly_in_flight() {
        let dir = tempdir().unwrap();
        let anchors = InMemorySyncStore::new();
        let transport = MockTransport::new();

        // Staged by another process moments ago
        let other_process = Outbox::new(dir.path(), 30).unwrap();
        let sending = other_process.stage(new_item("steps", vec![])).unwrap();

        let outbox = Outbox::new(dir.path(), 30).unwrap();
        let report = outbox.supersede(&user(), "steps").unwrap();
        assert_eq!(report, SupersedeReport { removed: 0, kept: 1 });
        assert!(outbox.find(&sending.id).unwrap().is_some());

        // A failure seen by this process means nobody is sending it any more
        transport.queue_response(500, "boom");
        outbox
            .upload(&sending, ENDPOINT, "Bearer t", &transport, &anchors)
            .unwrap_err();
        let report = outbox.supersede(&user(), "steps").unwrap();
        assert_eq!(report, SupersedeReport { removed: 1, kept: 0 });
        assert!(outbox.pending_items().unwrap().is_empty());
    }

    /// Accepts cursor writes only once `healthy` is set
    struct FlakyAnchors {
        inner: InMemorySyncStore,
        healthy: std::sync::atomic::AtomicBool,
    }

    impl AnchorStore for FlakyAnchors {
        fn get_cursor(&self, user: &UserKey, type_id: &DataTypeId) -> Result<Option<Cursor>> {
            self.inner.get_cursor(user, type_id)
        }

        fn set_cursor(&self, user: &UserKey, type_id: &DataTypeId, cursor: &Cursor) -> Result<()> {
            self.inner.set_cursor(user, type_id, cursor)
        }

        fn compare_and_set_cursor(
            &self,
            user: &UserKey,
            type_id: &DataTypeId,
            expected: Option<&Cursor>,
            cursor: &Cursor,
        ) -> Result<bool> {
            if !self.healthy.load(std::sync::atomic::Ordering::SeqCst) {
                bail!("database is locked");
            }
            self.inner.compare_and_set_cursor(user, type_id, expected, cursor)
        }

        fn is_full_export_done(&self, user: &UserKey) -> Result<bool> {
            self.inner.is_full_export_done(user)
        }

        fn set_full_export_done(&self, user: &UserKey, done: bool) -> Result<()> {
            self.inner.set_full_export_done(user, done)
        }

        fn reset_all(&self, user: &UserKey) -> Result<()> {
            self.inner.reset_all(user)
        }
    }

    #[test]
    fn test_acknowledged_item_is_committed_without_resending() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 3600).unwrap();
        let transport = MockTransport::new();
        let anchors = FlakyAnchors {
            inner: InMemorySyncStore::new(),
            healthy: std::sync::atomic::AtomicBool::new(false),
        };
        let steps = DataTypeId::new("steps");

        let item = outbox
            .stage(new_item("steps", vec![candidate("steps", None, "10")]))
            .unwrap();
        let err = outbox
            .upload(&item, ENDPOINT, "Bearer t", &transport, &anchors)
            .unwrap_err();
        assert!(matches!(err, UploadError::Storage(_)));
        assert!(outbox.is_acknowledged(&item));
        assert_eq!(transport.request_count(), 1);

        // Not superseded either: the backend already has it
        let report = outbox.supersede(&user(), "steps").unwrap();
        assert_eq!(report.kept, 1);

        anchors.healthy.store(true, std::sync::atomic::Ordering::SeqCst);
        let report = outbox.retry_pending(&user(), ENDPOINT, "Bearer t", &transport, &anchors);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.attempted, 0);
        assert_eq!(transport.request_count(), 1);
        assert_eq!(anchors.get_cursor(&user(), &steps).unwrap(), Some(Cursor::new("10")));
        assert!(outbox.pending_items().unwrap().is_empty());
        assert!(!outbox.ack_path(&item.id).exists());
    }

    #[test]
    fn test_pending_items_are_ordered_and_drop_corrupt_manifests() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 30).unwrap();
        let first = outbox.stage(new_item("a", vec![])).unwrap();
        let second = outbox.stage(new_item("b", vec![])).unwrap();
        fs::write(dir.path().join(format!("broken{}", MANIFEST_SUFFIX)), "{").unwrap();

        let items = outbox.pending_items().unwrap();
        assert_eq!(items, vec![first, second]);
        assert!(!dir.path().join(format!("broken{}", MANIFEST_SUFFIX)).exists());
    }

    #[test]
    fn test_orphaned_payload_is_removed() {
        let dir = tempdir().unwrap();
        let outbox = Outbox::new(dir.path(), 0).unwrap();
        let orphan = dir.path().join(format!("dead{}", PAYLOAD_SUFFIX));
        fs::write(&orphan, b"partial").unwrap();

        outbox.retry_pending(
            &user(),
            ENDPOINT,
            "Bearer t",
            &MockTransport::new(),
            &InMemorySyncStore::new(),
        );
        assert!(!orphan.exists());
    }
}
