//! In-memory storage implementations
//!
//! Used by tests and by hosts that embed the engine without persistence.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{AnchorStore, CredentialStore, SessionStore};
use crate::models::{Credentials, Cursor, DataTypeId, PluginSettings, UserKey};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory implementation of [`AnchorStore`] and [`SessionStore`]
#[derive(Default)]
pub struct InMemorySyncStore {
    anchors: RwLock<HashMap<(UserKey, DataTypeId), Cursor>>,
    full_export_done: RwLock<HashSet<UserKey>>,
    session: RwLock<Option<(UserKey, String)>>,
}

impl InMemorySyncStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed cursors across all users
    pub fn anchor_count(&self) -> usize {
        read(&self.anchors).len()
    }
}

impl AnchorStore for InMemorySyncStore {
    fn get_cursor(&self, user: &UserKey, type_id: &DataTypeId) -> Result<Option<Cursor>> {
        Ok(read(&self.anchors)
            .get(&(user.clone(), type_id.clone()))
            .cloned())
    }

    fn set_cursor(&self, user: &UserKey, type_id: &DataTypeId, cursor: &Cursor) -> Result<()> {
        write(&self.anchors).insert((user.clone(), type_id.clone()), cursor.clone());
        Ok(())
    }

    fn compare_and_set_cursor(
        &self,
        user: &UserKey,
        type_id: &DataTypeId,
        expected: Option<&Cursor>,
        cursor: &Cursor,
    ) -> Result<bool> {
        let mut anchors = write(&self.anchors);
        let key = (user.clone(), type_id.clone());
        if anchors.get(&key) != expected {
            return Ok(false);
        }
        anchors.insert(key, cursor.clone());
        Ok(true)
    }

    fn is_full_export_done(&self, user: &UserKey) -> Result<bool> {
        Ok(read(&self.full_export_done).contains(user))
    }

    fn set_full_export_done(&self, user: &UserKey, done: bool) -> Result<()> {
        let mut flags = write(&self.full_export_done);
        if done {
            flags.insert(user.clone());
        } else {
            flags.remove(user);
        }
        Ok(())
    }

    fn reset_all(&self, user: &UserKey) -> Result<()> {
        write(&self.anchors).retain(|(owner, _), _| owner != user);
        write(&self.full_export_done).remove(user);
        Ok(())
    }
}

impl SessionStore for InMemorySyncStore {
    fn load_session(&self) -> Result<Option<(UserKey, String)>> {
        Ok(read(&self.session).clone())
    }

    fn save_session(&self, user: &UserKey, data: &str) -> Result<()> {
        *write(&self.session) = Some((user.clone(), data.to_string()));
        Ok(())
    }

    fn delete_session(&self) -> Result<()> {
        *write(&self.session) = None;
        Ok(())
    }
}

/// In-memory implementation of [`CredentialStore`]
#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: RwLock<Option<Credentials>>,
    settings: RwLock<PluginSettings>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn load_credentials(&self) -> Result<Option<Credentials>> {
        Ok(read(&self.credentials).clone())
    }

    fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        *write(&self.credentials) = Some(credentials.clone());
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        *write(&self.credentials) = None;
        Ok(())
    }

    fn load_settings(&self) -> Result<PluginSettings> {
        Ok(read(&self.settings).clone())
    }

    fn save_settings(&self, settings: &PluginSettings) -> Result<()> {
        *write(&self.settings) = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn user(id: &str) -> UserKey {
        UserKey::for_user(id)
    }

    #[test]
    fn test_cursor_crud() {
        let store = InMemorySyncStore::new();
        let steps = DataTypeId::new("steps");

        assert!(store.get_cursor(&user("a"), &steps).unwrap().is_none());

        store.set_cursor(&user("a"), &steps, &Cursor::new("10")).unwrap();
        assert_eq!(
            store.get_cursor(&user("a"), &steps).unwrap(),
            Some(Cursor::new("10"))
        );
        // Other users never see the cursor
        assert!(store.get_cursor(&user("b"), &steps).unwrap().is_none());
    }

    #[test]
    fn test_compare_and_set() {
        let store = InMemorySyncStore::new();
        let steps = DataTypeId::new("steps");

        assert!(store
            .compare_and_set_cursor(&user("a"), &steps, None, &Cursor::new("1"))
            .unwrap());
        // Stale expectation is rejected
        assert!(!store
            .compare_and_set_cursor(&user("a"), &steps, None, &Cursor::new("0"))
            .unwrap());
        assert!(store
            .compare_and_set_cursor(&user("a"), &steps, Some(&Cursor::new("1")), &Cursor::new("2"))
            .unwrap());
        assert_eq!(
            store.get_cursor(&user("a"), &steps).unwrap(),
            Some(Cursor::new("2"))
        );
    }

    #[test]
    fn test_reset_all_only_affects_user() {
        let store = InMemorySyncStore::new();
        let steps = DataTypeId::new("steps");
        store.set_cursor(&user("a"), &steps, &Cursor::new("1")).unwrap();
        store.set_cursor(&user("b"), &steps, &Cursor::new("2")).unwrap();
        store.set_full_export_done(&user("a"), true).unwrap();

        store.reset_all(&user("a")).unwrap();

        assert!(store.get_cursor(&user("a"), &steps).unwrap().is_none());
        assert!(!store.is_full_export_done(&user("a")).unwrap());
        assert_eq!(
            store.get_cursor(&user("b"), &steps).unwrap(),
            Some(Cursor::new("2"))
        );
    }

    #[test]
    fn test_session_slot() {
        let store = InMemorySyncStore::new();
        assert!(store.load_session().unwrap().is_none());

        store.save_session(&user("a"), "{}").unwrap();
        let (owner, data) = store.load_session().unwrap().unwrap();
        assert_eq!(owner, user("a"));
        assert_eq!(data, "{}");

        store.delete_session().unwrap();
        assert!(store.load_session().unwrap().is_none());
    }

    #[test]
    fn test_credentials_and_expiry() {
        let store = InMemoryCredentialStore::new();
        let margin = Duration::minutes(5);
        assert!(store.is_expired(Utc::now(), margin).unwrap());

        let creds = Credentials::new("u1", "Bearer t").with_expiry(Utc::now() + Duration::hours(1));
        store.save_credentials(&creds).unwrap();
        assert!(!store.is_expired(Utc::now(), margin).unwrap());

        store.clear_all().unwrap();
        assert!(store.load_credentials().unwrap().is_none());
    }
}
