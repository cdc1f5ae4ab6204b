//! Configuration file parser for ~/.config/archdict/config.toml.
//!
//! The config file is optional; a missing or empty file yields
//! `Config::default()`. Unknown keys are accepted but logged as likely typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::catalog::CatalogSettings;
use crate::ingest::IngestMode;
use crate::library::DEFAULT_RECENT_LIMIT;
use crate::storage::DEFAULT_SEARCH_LIMIT;
use crate::util::validate_catalog_url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value parsed but is not usable
    #[error("Invalid config value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store location. `None` uses `store.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Catalog Open API endpoint.
    pub api_url: String,

    /// Dataset index of the dictionary on the catalog portal.
    pub api_index: u32,

    /// Records per catalog page.
    pub page_size: u32,

    /// Pause between page requests, in milliseconds.
    pub page_delay_ms: u64,

    /// Per-request timeout, in seconds.
    pub request_timeout_secs: u64,

    /// Retries for rate limiting, server errors and truncated bodies.
    pub max_retries: u32,

    /// First retry backoff, in milliseconds; doubles on each retry.
    pub retry_base_delay_ms: u64,

    pub user_agent: String,

    /// `batch` (all or nothing) or `streaming` (commit per page).
    pub ingest_mode: IngestMode,

    /// Items returned by the recent-items listing.
    pub recent_limit: i64,

    /// Default page size for searches.
    pub search_limit: i64,
}

impl Default for Config {
    fn default() -> Self {
        let catalog = CatalogSettings::default();
        Self {
            database_path: None,
            api_url: catalog.base_url,
            api_index: catalog.api_index,
            page_size: catalog.page_size,
            page_delay_ms: catalog.page_delay.as_millis() as u64,
            request_timeout_secs: catalog.request_timeout.as_secs(),
            max_retries: catalog.max_retries,
            retry_base_delay_ms: catalog.retry_base_delay.as_millis() as u64,
            user_agent: catalog.user_agent,
            ingest_mode: IngestMode::default(),
            recent_limit: DEFAULT_RECENT_LIMIT,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

const KNOWN_KEYS: [&str; 12] = [
    "database_path",
    "api_url",
    "api_index",
    "page_size",
    "page_delay_ms",
    "request_timeout_secs",
    "max_retries",
    "retry_base_delay_ms",
    "user_agent",
    "ingest_mode",
    "recent_limit",
    "search_limit",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unusable values → `Err(ConfigError::Invalid)`
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

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys().filter(|k| !KNOWN_KEYS.contains(&k.as_str())) {
                tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            ingest_mode = %config.ingest_mode,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_catalog_url(&self.api_url).map_err(|e| ConfigError::Invalid {
            key: "api_url",
            reason: e.to_string(),
        })?;

        if self.page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "page_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "request_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.recent_limit < 0 {
            return Err(ConfigError::Invalid {
                key: "recent_limit",
                reason: "must not be negative".into(),
            });
        }
        if self.search_limit <= 0 {
            return Err(ConfigError::Invalid {
                key: "search_limit",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Catalog client settings derived from this config.
    pub fn catalog_settings(&self) -> CatalogSettings {
        CatalogSettings {
            base_url: self.api_url.clone(),
            api_index: self.api_index,
            page_size: self.page_size,
            page_delay: Duration::from_millis(self.page_delay_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            user_agent: self.user_agent.clone(),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
