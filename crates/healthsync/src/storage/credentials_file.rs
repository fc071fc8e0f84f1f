//! File-based credential store
//!
//! Directory structure:
//! ```text
//! <dir>/
//!   credentials.json   # user id, tokens, expiry
//!   settings.json      # host, endpoint template, tracked types, sync flag
//! ```
//!
//! Both files are replaced atomically.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use log::warn;

use super::CredentialStore;
use crate::models::{Credentials, PluginSettings};

const CREDENTIALS_FILE: &str = "credentials.json";
const SETTINGS_FILE: &str = "settings.json";

pub struct FileCredentialStore {
    dir: PathBuf,
    /// Serializes read-modify-write of the two files
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("Failed to create credential directory")?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// Store in the shared health-sync config directory
    pub fn in_config_dir() -> Result<Self> {
        let dir = ::config::ensure_config_dir()?;
        Self::new(dir)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn credentials_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }
}

impl CredentialStore for FileCredentialStore {
    fn load_credentials(&self) -> Result<Option<Credentials>> {
        let _guard = self.guard();
        let path = self.credentials_path();
        match ::config::load_json_file_if_exists::<Credentials>(&path) {
            Ok(creds) => Ok(creds),
            Err(e) => {
                // Unreadable credentials mean "signed out"; the user must sign in again
                warn!("Discarding unreadable credentials file: {:#}", e);
                ::config::remove_file_if_exists(&path)?;
                Ok(None)
            }
        }
    }

    fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        let _guard = self.guard();
        ::config::save_json_file(&self.credentials_path(), credentials)
    }

    fn clear_all(&self) -> Result<()> {
        let _guard = self.guard();
        ::config::remove_file_if_exists(&self.credentials_path())
    }

    fn load_settings(&self) -> Result<PluginSettings> {
        let _guard = self.guard();
        let path = self.settings_path();
        match ::config::load_json_file_if_exists::<PluginSettings>(&path) {
            Ok(settings) => Ok(settings.unwrap_or_default()),
            Err(e) => {
                warn!("Resetting unreadable settings file: {:#}", e);
                ::config::remove_file_if_exists(&path)?;
                Ok(PluginSettings::default())
            }
        }
    }

    fn save_settings(&self, settings: &PluginSettings) -> Result<()> {
        let _guard = self.guard();
        ::config::save_json_file(&self.settings_path(), settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataTypeId;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    #[test]
    fn test_credentials_round_trip_and_clear() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path()).unwrap();
        assert!(store.load_credentials().unwrap().is_none());

        let creds = Credentials::new("u1", "Bearer abc")
            .with_refresh_token("r1")
            .with_expiry(Utc::now() + Duration::hours(1));
        store.save_credentials(&creds).unwrap();

        // A second instance over the same directory sees the same data
        let reopened = FileCredentialStore::new(dir.path()).unwrap();
        assert_eq!(reopened.load_credentials().unwrap(), Some(creds));

        reopened.clear_all().unwrap();
        assert!(store.load_credentials().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_credentials_treated_as_absent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CREDENTIALS_FILE), "not json").unwrap();

        let store = FileCredentialStore::new(dir.path()).unwrap();
        assert!(store.load_credentials().unwrap().is_none());
        assert!(!dir.path().join(CREDENTIALS_FILE).exists());
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path()).unwrap();
        assert_eq!(store.load_settings().unwrap(), PluginSettings::default());

        let settings = PluginSettings {
            host: Some("https://api.example.com".to_string()),
            endpoint_template: None,
            tracked_type_ids: vec![DataTypeId::new("steps"), DataTypeId::new("sleep")],
            sync_active: true,
        };
        store.save_settings(&settings).unwrap();
        assert_eq!(store.load_settings().unwrap(), settings);
    }
}
