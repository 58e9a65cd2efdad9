//! Agent configuration.
//!
//! Loaded from TOML. Every field has a default so a missing file is valid.

use crate::error::ConfigError;
use crate::locks::HashMethod;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CFSYNC_CONFIG";

/// Smallest usable `stream.max_buffer_size`. A frame must hold a signature
/// entry with the longest strong sum, and the receive window a copy command.
pub const MIN_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub locks: LockConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// Directory holding the lock database
    pub state_dir: PathBuf,
    /// How long to wait for another agent's critical section before taking it anyway
    pub critical_section_timeout_secs: u64,
    /// Bypass all lock persistence (every promise proceeds)
    pub ignore_locks: bool,
    /// Digest used for promise fingerprints
    pub hash_method: HashMethod,
    /// Process names a lock holder must carry before we will signal it
    pub agent_process_names: Vec<String>,
    /// Store size treated as 100% full when computing purge horizons
    pub max_store_bytes: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            critical_section_timeout_secs: 60,
            ignore_locks: false,
            hash_method: HashMethod::default(),
            agent_process_names: [
                "cf-agent",
                "cf-execd",
                "cf-serverd",
                "cf-monitord",
                "cf-hub",
                "cfsync",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_store_bytes: 100 * 1024 * 1024,
        }
    }
}

impl LockConfig {
    pub fn critical_section_timeout(&self) -> Duration {
        Duration::from_secs(self.critical_section_timeout_secs)
    }

    pub fn lock_db_path(&self) -> PathBuf {
        self.state_dir.join("cf_lock")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Transport buffer size; frame payloads are capped one byte below it
    pub max_buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 4096,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cfsync")
}

impl Config {
    /// Load configuration from `explicit`, `$CFSYNC_CONFIG`, or the user config dir.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let candidate = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| dirs::config_dir().map(|d| d.join("cfsync").join("config.toml")));

        match candidate {
            Some(path) if path.exists() => Self::from_file(&path),
            Some(path) if explicit.is_some() => Err(ConfigError::Read {
                path,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
            _ => {
                tracing::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.max_buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "stream.max_buffer_size must be at least {}, got {}",
                MIN_BUFFER_SIZE, self.stream.max_buffer_size
            )));
        }
        if self.locks.max_store_bytes == 0 {
            return Err(ConfigError::Invalid(
                "locks.max_store_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
