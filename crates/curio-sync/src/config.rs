//! Engine configuration.
//!
//! All durations are stored as milliseconds so the JSON form stays plain.
//! Every section defaults field by field, so a partial document such as
//! `{"api": {"base_url": "https://admin.example.com"}}` is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheOptions, DEFAULT_MAX_ENTRIES_PER_ROOT};
use crate::polling::{ConnectedPolling, PollPolicy};
use crate::sse::DEFAULT_EVENTS_PATH;
use crate::stream::{ReconnectPolicy, StreamOptions};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api: ApiConfig,
    pub events: EventsConfig,
    pub reconnect: ReconnectConfig,
    pub poll: PollConfig,
    pub cache: CacheConfig,
}

/// REST endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Path prefix prepended to every request path.
    pub prefix: String,
    /// Bearer token. Never written back out.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            prefix: "/api".to_string(),
            token: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl ApiConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Push channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub path: String,
    pub read_timeout_ms: u64,
    /// Capacity of the channel between the stream and the dispatcher.
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_EVENTS_PATH.to_string(),
            read_timeout_ms: 45_000,
            channel_capacity: 1024,
        }
    }
}

/// Backoff between push reconnection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Fallback polling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Interval while the push channel is not connected.
    pub interval_ms: u64,
    /// Interval while connected; `None` disables polling when connected.
    pub connected_interval_ms: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            connected_interval_ms: None,
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.interval_ms),
            when_connected: match self.connected_interval_ms {
                Some(ms) => ConnectedPolling::Every(Duration::from_millis(ms)),
                None => ConnectedPolling::Disabled,
            },
        }
    }
}

/// Cache retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// `None` keeps every entry.
    pub max_entries_per_root: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries_per_root: Some(DEFAULT_MAX_ENTRIES_PER_ROOT),
        }
    }
}

impl CacheConfig {
    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            max_entries_per_root: self.max_entries_per_root,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            reconnect: self.reconnect.policy(),
            read_timeout: Duration::from_millis(self.events.read_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.api.base_url.trim();
        if base_url.is_empty() {
            return Err(invalid("api.base_url", "must not be empty"));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(invalid(
                "api.base_url",
                format!("expected an http(s) URL (got {base_url})"),
            ));
        }
        if self.api.connect_timeout_ms == 0 {
            return Err(invalid("api.connect_timeout_ms", "must be positive"));
        }
        if self.api.request_timeout_ms == 0 {
            return Err(invalid("api.request_timeout_ms", "must be positive"));
        }
        if !self.events.path.starts_with('/') {
            return Err(invalid("events.path", "must start with '/'"));
        }
        if self.events.read_timeout_ms == 0 {
            return Err(invalid("events.read_timeout_ms", "must be positive"));
        }
        if self.events.channel_capacity == 0 {
            return Err(invalid("events.channel_capacity", "must be positive"));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 {
            return Err(invalid("reconnect.initial_delay_ms", "must be positive"));
        }
        if !(reconnect.multiplier.is_finite() && reconnect.multiplier > 1.0) {
            return Err(invalid(
                "reconnect.multiplier",
                format!("must be greater than 1 (got {})", reconnect.multiplier),
            ));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(invalid(
                "reconnect.max_delay_ms",
                format!(
                    "must be at least initial_delay_ms ({} < {})",
                    reconnect.max_delay_ms, reconnect.initial_delay_ms
                ),
            ));
        }

        if self.poll.interval_ms == 0 {
            return Err(invalid("poll.interval_ms", "must be positive"));
        }
        if self.poll.connected_interval_ms == Some(0) {
            return Err(invalid("poll.connected_interval_ms", "must be positive"));
        }
        if self.cache.max_entries_per_root == Some(0) {
            return Err(invalid("cache.max_entries_per_root", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config =
            SyncConfig::from_json(r#"{"api": {"base_url": "https://admin.example.com"}, "poll": {"connected_interval_ms": 60000}}"#)
                .unwrap();
        assert_eq!(config.api.base_url, "https://admin.example.com");
        assert_eq!(config.api.prefix, "/api");
        assert_eq!(config.events.path, "/api/events");
        assert_eq!(
            config.poll.policy().when_connected,
            ConnectedPolling::Every(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let mut config = SyncConfig::default();
        config.reconnect.multiplier = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "reconnect.multiplier", .. })
        ));

        let mut config = SyncConfig::default();
        config.reconnect.max_delay_ms = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "reconnect.max_delay_ms", .. })
        ));
    }

    #[test]
    fn test_rejects_empty_url_and_zero_timeouts() {
        let mut config = SyncConfig::default();
        config.api.base_url = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.api.request_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.events.read_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_is_not_serialized() {
        let mut config = SyncConfig::default();
        config.api.token = Some("secret".to_string());
        let text = serde_json::to_string(&config).unwrap();
        assert!(!text.contains("secret"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curio.json");
        std::fs::write(&path, r#"{"reconnect": {"initial_delay_ms": 250}}"#).unwrap();
        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.reconnect.policy().initial, Duration::from_millis(250));
    }
}
