//! Configuration loading and representation.
//!
//! Tunables live in a JSON file, by default `~/.queuectl/config.json`:
//!
//! ```json
//! {
//!   "max-retries": 3,
//!   "backoff-base": 2,
//!   "poll-interval-ms": 1000,
//!   "retry-sweep-interval-ms": 1000,
//!   "max-store-failures": 5,
//!   "db-path": null
//! }
//! ```
//!
//! Environment overrides:
//! - `QUEUECTL_CONFIG`: path of the config file
//! - `QUEUECTL_DB`: path of the SQLite database (wins over `db-path`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use queuectl_core::{RetryPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES};

use crate::jobs::WorkerSettings;

pub const CONFIG_PATH_ENV: &str = "QUEUECTL_CONFIG";
pub const DB_PATH_ENV: &str = "QUEUECTL_DB";

const APP_DIR: &str = ".queuectl";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path} is not valid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown config key '{0}'")]
    UnknownKey(String),
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("could not determine the home directory")]
    NoHomeDir,
}

/// Queue tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QueueConfig {
    /// Default `max_retries` for new jobs.
    pub max_retries: u32,
    pub backoff_base: u32,
    pub poll_interval_ms: u64,
    pub retry_sweep_interval_ms: u64,
    pub max_store_failures: u32,
    pub db_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            poll_interval_ms: 1000,
            retry_sweep_interval_ms: 1000,
            max_store_failures: 5,
            db_path: None,
        }
    }
}

impl QueueConfig {
    /// Names of all settable keys.
    pub fn keys() -> Vec<String> {
        match serde_json::to_value(Self::default()) {
            Ok(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Current value of `key` as JSON.
    pub fn get(&self, key: &str) -> Result<Value, ConfigError> {
        let map = self.to_map(key)?;
        map.get(key)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))
    }

    /// Set `key` from its command-line text.
    ///
    /// `raw` is read as JSON when it parses (`5`, `null`, `"x"`), otherwise as
    /// a bare string (`/var/lib/queue.db`).
    pub fn set(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let mut map = self.to_map(key)?;
        if !map.contains_key(key) {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }

        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);

        let updated: QueueConfig =
            serde_json::from_value(Value::Object(map)).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        updated.validate()?;

        *self = updated;
        Ok(())
    }

    /// Reject values the workers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("backoff-base", self.backoff_base as u64),
            ("poll-interval-ms", self.poll_interval_ms),
            ("retry-sweep-interval-ms", self.retry_sweep_interval_ms),
            ("max-store-failures", self.max_store_failures as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_base)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retry_sweep_interval: Duration::from_millis(self.retry_sweep_interval_ms),
            max_store_failures: self.max_store_failures,
            retry_policy: self.retry_policy(),
            ..WorkerSettings::default()
        }
    }

    /// Database location: `QUEUECTL_DB`, then `db-path`, then `~/.queuectl/jobs.db`.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os(DB_PATH_ENV).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }
        Ok(app_dir()?.join("jobs.db"))
    }

    fn to_map(&self, key: &str) -> Result<serde_json::Map<String, Value>, ConfigError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ConfigError::UnknownKey(key.to_string())),
            Err(e) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// The config file on disk.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `QUEUECTL_CONFIG` if set, otherwise `~/.queuectl/config.json`.
    pub fn locate() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
            return Ok(Self::new(path));
        }
        Ok(Self::new(app_dir()?.join("config.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the config, writing the defaults first if the file does not exist.
    pub fn load_or_init(&self) -> Result<QueueConfig, ConfigError> {
        if !self.path.exists() {
            let config = QueueConfig::default();
            self.save(&config)?;
            info!(path = %self.path.display(), "created default config");
            return Ok(config);
        }

        let raw = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        let config: QueueConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
                path: self.path.clone(),
                source,
            })?;
        config.validate()?;

        debug!(path = %self.path.display(), "loaded config");
        Ok(config)
    }

    pub fn save(&self, config: &QueueConfig) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Json {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, json + "\n").map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn app_dir() -> Result<PathBuf, ConfigError> {
    let mut dir = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    dir.push(APP_DIR);
    Ok(dir)
}
