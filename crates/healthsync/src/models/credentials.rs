//! Credentials and persisted plugin settings

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{DataTypeId, UserKey};

/// Authorization material for the backend
///
/// Either `refresh_token` or the legacy `app_id` + `app_secret` pair can be
/// used to obtain a new access token. When neither is present the token is
/// an API key and cannot be refreshed.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    /// Value sent verbatim in the `Authorization` header
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub token_expiry: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
            refresh_token: None,
            app_id: None,
            app_secret: None,
            token_expiry: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_app_secret(mut self, app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self.app_secret = Some(app_secret.into());
        self
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.token_expiry = Some(expiry);
        self
    }

    /// Key under which this user's anchors and sessions are stored
    pub fn user_key(&self) -> UserKey {
        UserKey::for_user(&self.user_id)
    }

    /// Whether the token must be refreshed before use
    ///
    /// A token without a known expiry is treated as valid; the backend's
    /// 401 response is the only signal for those.
    pub fn is_expired(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        match self.token_expiry {
            Some(expiry) => now + safety_margin > expiry,
            None => false,
        }
    }

    /// Whether refresh material is configured
    pub fn can_refresh(&self) -> bool {
        let has_refresh_token = self.refresh_token.as_deref().is_some_and(|t| !t.is_empty());
        let has_app_secret = self.app_id.as_deref().is_some_and(|id| !id.is_empty())
            && self.app_secret.as_deref().is_some_and(|s| !s.is_empty());
        has_refresh_token || has_app_secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("app_id", &self.app_id)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "[REDACTED]"))
            .field("token_expiry", &self.token_expiry)
            .finish()
    }
}

/// Non-secret plugin state kept next to the credentials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Backend host set through `configure`
    #[serde(default)]
    pub host: Option<String>,
    /// Custom sync URL template overriding the default path
    #[serde(default)]
    pub endpoint_template: Option<String>,
    /// Types to sync, in upload order
    #[serde(default)]
    pub tracked_type_ids: Vec<DataTypeId>,
    /// Whether background triggers are enabled
    #[serde(default)]
    pub sync_active: bool,
}

/// Turn a bare token into the form expected by the `Authorization` header
pub fn normalize_auth_header(token: &str) -> String {
    let token = token.trim();
    let has_scheme = ["Bearer ", "Basic ", "Token "]
        .iter()
        .any(|scheme| {
            token.len() > scheme.len()
                && token.get(..scheme.len()).is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        });
    if has_scheme {
        token.to_string()
    } else {
        format!("Bearer {}", token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_with_safety_margin() {
        let now = Utc::now();
        let margin = Duration::minutes(5);

        let fresh = Credentials::new("u1", "t").with_expiry(now + Duration::minutes(30));
        assert!(!fresh.is_expired(now, margin));

        // Inside the safety margin counts as expired
        let almost = Credentials::new("u1", "t").with_expiry(now + Duration::minutes(4));
        assert!(almost.is_expired(now, margin));

        let past = Credentials::new("u1", "t").with_expiry(now - Duration::minutes(1));
        assert!(past.is_expired(now, margin));
    }

    #[test]
    fn test_unknown_expiry_is_not_expired() {
        let creds = Credentials::new("u1", "t");
        assert!(!creds.is_expired(Utc::now(), Duration::minutes(5)));
    }

    #[test]
    fn test_can_refresh() {
        assert!(!Credentials::new("u1", "t").can_refresh());
        assert!(Credentials::new("u1", "t").with_refresh_token("r").can_refresh());
        assert!(Credentials::new("u1", "t").with_app_secret("app", "secret").can_refresh());
        assert!(!Credentials::new("u1", "t").with_refresh_token("").can_refresh());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new("u1", "super-secret-token")
            .with_refresh_token("refresh-secret")
            .with_app_secret("app", "app-secret");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super-secret-token"));
        assert!(!debug.contains("refresh-secret"));
        assert!(!debug.contains("app-secret"));
        assert!(debug.contains("u1"));
    }

    #[test]
    fn test_normalize_auth_header() {
        assert_eq!(normalize_auth_header("abc"), "Bearer abc");
        assert_eq!(normalize_auth_header("Bearer abc"), "Bearer abc");
        assert_eq!(normalize_auth_header("bearer abc"), "bearer abc");
        assert_eq!(normalize_auth_header("  abc  "), "Bearer abc");
    }

    #[test]
    fn test_settings_defaults_from_empty_json() {
        let settings: PluginSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.host.is_none());
        assert!(settings.tracked_type_ids.is_empty());
        assert!(!settings.sync_active);
    }
}
