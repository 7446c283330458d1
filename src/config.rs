//! Configuration file parser for ~/.config/tidings/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde and logged as warnings so typos are
//! visible.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::remote::RetryPolicy;
use crate::storage::{DefaultReadPolicy, DEFAULT_CACHE_CAPACITY};
use crate::sync::SyncSettings;

/// Environment variable that overrides `api_token` from the file.
pub const API_TOKEN_ENV: &str = "TIDINGS_API_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("No base_url configured")]
    MissingBaseUrl,

    #[error("Invalid base_url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Which kind of remote the base URL points at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Paginated id streams.
    #[default]
    Stream,
    /// Token-based change feed over a record zone.
    Zone,
}

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// The custom Debug impl masks `api_token`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderKind,

    /// Root URL of the remote API. Must be https unless it points at localhost.
    pub base_url: Option<String>,

    /// Zone name for `provider = "zone"`.
    pub zone_name: String,

    /// Unstarred articles older than this many days are deleted once the
    /// remote no longer lists them.
    pub retention_days: u32,

    /// How far back a first sync looks for updated articles.
    pub unread_window_days: u32,

    /// Pending changes claimed per pass.
    pub status_batch_size: usize,

    /// Ids per entry download request.
    pub entries_chunk_size: usize,

    /// Records per zone modify request.
    pub modify_chunk_size: usize,

    /// Retries after the first attempt for transient remote errors.
    pub max_retries: u32,

    /// Read state given to articles seen for the first time.
    pub default_read: DefaultReadPolicy,

    pub request_timeout_secs: u64,

    /// Entries per in-memory article and status cache.
    pub cache_capacity: usize,

    /// Bearer token (alternative to the TIDINGS_API_TOKEN env var).
    /// Env var takes precedence over config file.
    pub api_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Stream,
            base_url: None,
            zone_name: "articles".to_string(),
            retention_days: 30,
            unread_window_days: 31,
            status_batch_size: 1000,
            entries_chunk_size: 1000,
            modify_chunk_size: 200,
            max_retries: 3,
            default_read: DefaultReadPolicy::Unread,
            request_timeout_secs: 30,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            api_token: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("zone_name", &self.zone_name)
            .field("retention_days", &self.retention_days)
            .field("unread_window_days", &self.unread_window_days)
            .field("status_batch_size", &self.status_batch_size)
            .field("entries_chunk_size", &self.entries_chunk_size)
            .field("modify_chunk_size", &self.modify_chunk_size)
            .field("max_retries", &self.max_retries)
            .field("default_read", &self.default_read)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("cache_capacity", &self.cache_capacity)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

const KNOWN_KEYS: [&str; 13] = [
    "provider",
    "base_url",
    "zone_name",
    "retention_days",
    "unread_window_days",
    "status_batch_size",
    "entries_chunk_size",
    "modify_chunk_size",
    "max_retries",
    "default_read",
    "request_timeout_secs",
    "cache_capacity",
    "api_token",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse TOML text. Blank text yields defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(provider = ?config.provider, "Loaded configuration");
        Ok(config)
    }

    /// The validated base URL.
    ///
    /// Plain http is only allowed for loopback hosts. A trailing slash is
    /// added so relative endpoint paths join under the base path.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let raw = self.base_url.as_deref().ok_or(ConfigError::MissingBaseUrl)?;
        let invalid = |reason: &str| ConfigError::InvalidBaseUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "https" => {}
            "http" if is_loopback(&url) => {}
            "http" => return Err(invalid("https is required for non-local hosts")),
            _ => return Err(invalid("scheme must be http or https")),
        }
        if url.cannot_be_a_base() {
            return Err(invalid("not a base URL"));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// The bearer token, preferring the environment over the file.
    pub fn api_token(&self) -> Option<SecretString> {
        self.resolve_token(std::env::var(API_TOKEN_ENV).ok())
    }

    fn resolve_token(&self, from_env: Option<String>) -> Option<SecretString> {
        from_env
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.api_token.clone())
            .map(SecretString::from)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Engine tunables derived from this config.
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            status_batch_size: self.status_batch_size.max(1),
            entries_chunk_size: self.entries_chunk_size.max(1),
            modify_chunk_size: self.modify_chunk_size.max(1),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            },
            default_read: self.default_read,
            retention_days: i64::from(self.retention_days),
            unread_window_days: i64::from(self.unread_window_days),
            zone_name: self.zone_name.clone(),
            ..SyncSettings::default()
        }
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

// ============================================================================
// Tests
// ============================================================================
