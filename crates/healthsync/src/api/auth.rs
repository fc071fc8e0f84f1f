//! Access token refresh
//!
//! Tokens are refreshed lazily: before a pass when the stored token is
//! inside the safety margin, and after a 401 from the sync endpoint.
//! A mutex serializes refreshes so concurrent callers never race two
//! refresh calls against the backend.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

use super::{HttpRequest, HttpTransport};
use crate::config::SyncConfig;
use crate::models::{Credentials, normalize_auth_header};
use crate::storage::CredentialStore;

/// Body of the refresh call
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RefreshRequest<'a> {
    RefreshToken {
        refresh_token: &'a str,
    },
    AppSecret {
        app_id: &'a str,
        app_secret: &'a str,
    },
}

/// Token response from the backend
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct TokenManager {
    credentials: Arc<dyn CredentialStore>,
    transport: Arc<dyn HttpTransport>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(credentials: Arc<dyn CredentialStore>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            credentials,
            transport,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Make sure the stored token is usable for the next request
    ///
    /// Returns true immediately (no I/O beyond the credential read) when the
    /// token is outside the safety margin. Returns false when there is no
    /// signed-in user, no refresh material, or the refresh call fails; stored
    /// credentials are left untouched in that case.
    pub fn ensure_fresh_token(&self, config: &SyncConfig) -> bool {
        let margin = config.token_safety_margin();
        match self.load() {
            Some(creds) if !creds.is_expired(Utc::now(), margin) => return true,
            Some(_) => {}
            None => return false,
        }

        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Another caller may have refreshed while we waited
        let Some(creds) = self.load() else {
            return false;
        };
        if !creds.is_expired(Utc::now(), margin) {
            debug!("Token refreshed by a concurrent caller");
            return true;
        }

        self.refresh_and_store(config, creds)
    }

    /// Refresh after the backend rejected `rejected_token` with a 401
    ///
    /// If the stored token already differs from the rejected one, a
    /// concurrent refresh won and no call is made.
    pub fn force_refresh(&self, config: &SyncConfig, rejected_token: &str) -> bool {
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(creds) = self.load() else {
            return false;
        };
        if creds.access_token != rejected_token {
            debug!("Token already replaced since the rejected request");
            return true;
        }

        self.refresh_and_store(config, creds)
    }

    fn load(&self) -> Option<Credentials> {
        match self.credentials.load_credentials() {
            Ok(creds) => creds,
            Err(e) => {
                warn!("Failed to load credentials: {:#}", e);
                None
            }
        }
    }

    fn refresh_and_store(&self, config: &SyncConfig, creds: Credentials) -> bool {
        if !creds.can_refresh() {
            warn!("Access token expired and no refresh credentials are configured");
            return false;
        }

        let response = match self.request_token(config, &creds) {
            Ok(response) => response,
            Err(e) => {
                warn!("Token refresh failed: {:#}", e);
                return false;
            }
        };

        let mut updated = creds.with_expiry(Utc::now() + config.token_lifetime());
        updated.access_token = normalize_auth_header(&response.access_token);
        if let Some(refresh_token) = response.refresh_token.filter(|t| !t.is_empty()) {
            updated.refresh_token = Some(refresh_token);
        }

        if let Err(e) = self.credentials.save_credentials(&updated) {
            warn!("Failed to persist refreshed token: {:#}", e);
            return false;
        }

        info!("Access token refreshed for user {}", updated.user_id);
        true
    }

    fn request_token(&self, config: &SyncConfig, creds: &Credentials) -> Result<TokenResponse> {
        let body = match (&creds.refresh_token, &creds.app_id, &creds.app_secret) {
            (Some(refresh_token), _, _) if !refresh_token.is_empty() => {
                RefreshRequest::RefreshToken {
                    refresh_token: refresh_token.as_str(),
                }
            }
            (_, Some(app_id), Some(app_secret)) => RefreshRequest::AppSecret {
                app_id: app_id.as_str(),
                app_secret: app_secret.as_str(),
            },
            _ => bail!("no refresh material"),
        };

        let url = config.token_url(&creds.user_id);
        let body = serde_json::to_vec(&body)?;
        let response = self
            .transport
            .post(&HttpRequest::json(&url, body, None))
            .context("Failed to send token refresh request")?;

        if !response.is_success() {
            bail!("token endpoint returned HTTP {}", response.status);
        }

        let token: TokenResponse =
            serde_json::from_str(&response.body).context("Failed to parse token response")?;
        if token.access_token.trim().is_empty() {
            bail!("token endpoint returned an empty access token");
        }
        Ok(token)
    }
}
