//! Configuration file parser for ~/.config/feedex/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as a warning, since they are
//! usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::storage::{StoreOptions, BACKUP_FILE_NAME, DATABASE_NAME};

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
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database file. Defaults to `FeedEx.db` in the config directory.
    pub database_path: Option<PathBuf>,

    /// Backup OPML location. Defaults to `FeedEx_auto_backup.opml` in `$HOME`.
    pub backup_path: Option<PathBuf>,

    /// How long SQLite waits on a locked database before giving up.
    pub busy_timeout_ms: u64,

    pub max_connections: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            backup_path: None,
            busy_timeout_ms: 5000,
            max_connections: 5,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 4] = [
        "database_path",
        "backup_path",
        "busy_timeout_ms",
        "max_connections",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading so a corrupted file can't exhaust memory
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
                // File deleted between metadata and read
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
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Database location, relative to `config_dir` unless configured.
    pub fn database_path_in(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join(DATABASE_NAME))
    }

    /// Backup location, in `home` unless configured.
    pub fn backup_path_in(&self, home: &Path) -> PathBuf {
        self.backup_path
            .clone()
            .unwrap_or_else(|| home.join(BACKUP_FILE_NAME))
    }

    pub fn store_options(&self, home: &Path) -> StoreOptions {
        StoreOptions {
            backup_path: self.backup_path_in(home),
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            max_connections: self.max_connections,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
