//! Sync engine configuration
//!
//! Supports loading configuration from (in order of priority):
//! 1. JSON file (`sync-config.json` in the health-sync config directory)
//! 2. Runtime environment variables (fallback)
//!
//! Mobile hosts usually build the config programmatically through the FFI.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Config filename in the health-sync config directory
const CONFIG_FILE: &str = "sync-config.json";

/// Environment variable holding the backend host
const HOST_ENV: &str = "HEALTH_SYNC_HOST";

const DEFAULT_ENDPOINT_TEMPLATE: &str = "{host}/api/v1/sdk/users/{userId}/sync/{platform}";
const TOKEN_PATH_TEMPLATE: &str = "{host}/api/v1/users/{userId}/token";

/// How pending types are packed into upload requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// One payload sequence per data type, committed type by type
    #[default]
    PerType,
    /// All pending types bundled; every cursor commits with the final chunk
    Combined,
}

/// Runtime configuration for a [`crate::SyncEngine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub host: String,
    pub platform: String,
    /// Custom sync URL with `{host}`, `{userId}` and `{platform}` placeholders
    pub endpoint_template: Option<String>,
    pub chunk_size: usize,
    pub upload_mode: UploadMode,
    /// Max samples requested per health source read (`None` = unbounded)
    pub read_limit: Option<usize>,
    pub full_export_lookback_days: u32,
    pub token_safety_margin_secs: u64,
    pub token_lifetime_secs: u64,
    pub outbox_grace_secs: u64,
    pub debounce_ms: u64,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            platform: "apple".to_string(),
            endpoint_template: None,
            chunk_size: 2000,
            upload_mode: UploadMode::PerType,
            read_limit: None,
            full_export_lookback_days: 365,
            token_safety_margin_secs: 300,
            token_lifetime_secs: 3600,
            outbox_grace_secs: 30,
            debounce_ms: 2000,
            http_timeout_secs: 60,
        }
    }
}

impl SyncConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: normalize_host(&host.into()),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = normalize_host(&host.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_endpoint_template(mut self, template: impl Into<String>) -> Self {
        self.endpoint_template = Some(template.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_upload_mode(mut self, mode: UploadMode) -> Self {
        self.upload_mode = mode;
        self
    }

    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = Some(limit);
        self
    }

    pub fn with_outbox_grace_secs(mut self, secs: u64) -> Self {
        self.outbox_grace_secs = secs;
        self
    }

    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    /// Load the config using the following priority:
    /// 1. JSON file (~/.config/health-sync/sync-config.json)
    /// 2. Runtime environment variables
    pub fn load() -> Result<Self> {
        if ::config::config_exists(CONFIG_FILE) {
            let config: SyncConfig = ::config::load_json(CONFIG_FILE)?;
            return Ok(config.normalized());
        }
        Self::from_env()
    }

    /// Load the config from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: SyncConfig = ::config::load_json_file(path)?;
        Ok(config.normalized())
    }

    /// Build a default config around the host from the environment
    pub fn from_env() -> Result<Self> {
        let host = std::env::var(HOST_ENV)
            .with_context(|| format!("{} environment variable not set", HOST_ENV))?;
        Ok(Self::new(host))
    }

    fn normalized(mut self) -> Self {
        self.host = normalize_host(&self.host);
        self
    }

    /// Check the rules that must hold before any sync pass
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        validate_host(&self.host)?;

        if let Some(template) = &self.endpoint_template {
            let expanded = self.expand(template, "user");
            if url::Url::parse(&expanded).is_err() {
                return Err(ConfigError::InvalidEndpointTemplate {
                    reason: format!("{:?} does not expand to an absolute URL", template),
                });
            }
        }

        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        Ok(())
    }

    /// URL receiving sample uploads for a user
    pub fn sync_url(&self, user_id: &str) -> String {
        let template = self
            .endpoint_template
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT_TEMPLATE);
        self.expand(template, user_id)
    }

    /// URL of the token refresh call for a user
    pub fn token_url(&self, user_id: &str) -> String {
        self.expand(TOKEN_PATH_TEMPLATE, user_id)
    }

    fn expand(&self, template: &str, user_id: &str) -> String {
        template
            .replace("{host}", &self.host)
            .replace("{userId}", &urlencoding::encode(user_id))
            .replace("{platform}", &self.platform)
    }

    pub fn token_safety_margin(&self) -> Duration {
        Duration::seconds(self.token_safety_margin_secs as i64)
    }

    pub fn token_lifetime(&self) -> Duration {
        Duration::seconds(self.token_lifetime_secs as i64)
    }

    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_ms)
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs)
    }

    /// Lower bound for reads that have no cursor
    pub fn lookback_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.full_export_lookback_days as i64)
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('/').to_string()
}

fn validate_host(host: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(host).map_err(|e| ConfigError::InvalidHost {
        host: host.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidHost {
            host: host.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::new("https://api.example.com/");
        assert_eq!(config.host, "https://api.example.com");
        assert_eq!(config.chunk_size, 2000);
        assert_eq!(config.platform, "apple");
        assert_eq!(config.upload_mode, UploadMode::PerType);
        assert_eq!(config.outbox_grace_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        assert_eq!(SyncConfig::default().validate(), Err(ConfigError::MissingHost));

        let bad_scheme = SyncConfig::new("ftp://example.com");
        assert!(matches!(
            bad_scheme.validate(),
            Err(ConfigError::InvalidHost { .. })
        ));

        let not_a_url = SyncConfig::new("example");
        assert!(matches!(
            not_a_url.validate(),
            Err(ConfigError::InvalidHost { .. })
        ));

        let zero_chunk = SyncConfig::new("https://api.example.com").with_chunk_size(0);
        assert_eq!(zero_chunk.validate(), Err(ConfigError::InvalidChunkSize));
    }

    #[test]
    fn test_sync_url_default_and_template() {
        let config = SyncConfig::new("https://api.example.com");
        assert_eq!(
            config.sync_url("user 1"),
            "https://api.example.com/api/v1/sdk/users/user%201/sync/apple"
        );
        assert_eq!(
            config.token_url("u1"),
            "https://api.example.com/api/v1/users/u1/token"
        );

        let custom = SyncConfig::new("https://api.example.com")
            .with_platform("samsung")
            .with_endpoint_template("{host}/ingest/{platform}/{userId}");
        assert_eq!(
            custom.sync_url("u1"),
            "https://api.example.com/ingest/samsung/u1"
        );
    }

    #[test]
    fn test_load_from_file_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync-config.json");
        std::fs::write(
            &path,
            r#"{"host": "https://api.example.com/", "chunk_size": 500, "upload_mode": "combined"}"#,
        )
        .unwrap();

        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.host, "https://api.example.com");
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.upload_mode, UploadMode::Combined);
        assert_eq!(config.token_lifetime_secs, 3600);
    }

    #[test]
    fn test_lookback_start() {
        let config = SyncConfig::new("https://api.example.com");
        let now = Utc::now();
        assert_eq!(config.lookback_start(now), now - Duration::days(365));
    }
}
