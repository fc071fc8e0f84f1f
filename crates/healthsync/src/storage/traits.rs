//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::models::{Credentials, Cursor, DataTypeId, PluginSettings, UserKey};

/// Per-(user, type) read positions and the per-user full-export flag
///
/// Each (user, type) cursor is an independent record, so concurrent writers
/// for different types never overwrite each other.
pub trait AnchorStore: Send + Sync {
    /// Last committed cursor, or `None` if never synced or reset
    fn get_cursor(&self, user: &UserKey, type_id: &DataTypeId) -> Result<Option<Cursor>>;

    /// Commit a cursor for a type
    fn set_cursor(&self, user: &UserKey, type_id: &DataTypeId, cursor: &Cursor) -> Result<()>;

    /// Commit `cursor` only if the stored value still equals `expected`
    ///
    /// Returns whether the cursor was written.
    fn compare_and_set_cursor(
        &self,
        user: &UserKey,
        type_id: &DataTypeId,
        expected: Option<&Cursor>,
        cursor: &Cursor,
    ) -> Result<bool>;

    fn is_full_export_done(&self, user: &UserKey) -> Result<bool>;

    fn set_full_export_done(&self, user: &UserKey, done: bool) -> Result<()>;

    /// Clear every cursor and the full-export flag for a user
    fn reset_all(&self, user: &UserKey) -> Result<()>;
}

/// Durable slot holding the serialized sync session
///
/// The store keeps the raw document so the session layer can detect and
/// discard corrupt state instead of failing inside the backend.
pub trait SessionStore: Send + Sync {
    /// Raw session document and the user key it was saved under
    fn load_session(&self) -> Result<Option<(UserKey, String)>>;

    fn save_session(&self, user: &UserKey, data: &str) -> Result<()>;

    fn delete_session(&self) -> Result<()>;
}

/// Credentials and non-secret plugin settings
pub trait CredentialStore: Send + Sync {
    fn load_credentials(&self) -> Result<Option<Credentials>>;

    fn save_credentials(&self, credentials: &Credentials) -> Result<()>;

    /// Remove all stored credential material
    fn clear_all(&self) -> Result<()>;

    fn load_settings(&self) -> Result<PluginSettings>;

    fn save_settings(&self, settings: &PluginSettings) -> Result<()>;

    /// Whether the stored token needs a refresh; missing credentials count as expired
    fn is_expired(&self, now: DateTime<Utc>, safety_margin: Duration) -> Result<bool> {
        Ok(self
            .load_credentials()?
            .is_none_or(|creds| creds.is_expired(now, safety_margin)))
    }
}
