//! Core configuration parsing and validation.
//!
//! Configuration is a small JSON document; every field has a default so an
//! empty object is a valid config.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "failed to parse config: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

/// Runtime settings for one note graph instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// SQLite file; `None` means an in-memory database.
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Absolute directory for rolling log files; `None` disables file logging.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Idle time after which the protected session is torn down.
    #[serde(default = "default_protected_session_timeout_secs")]
    pub protected_session_timeout_secs: u64,

    /// Records per sync pull/push request.
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            log_level: default_log_level(),
            log_dir: None,
            protected_session_timeout_secs: default_protected_session_timeout_secs(),
            sync_batch_size: default_sync_batch_size(),
        }
    }
}

fn default_log_level() -> String {
    crate::logging::default_log_level().to_string()
}

fn default_protected_session_timeout_secs() -> u64 {
    600
}

fn default_sync_batch_size() -> u32 {
    100
}

impl CoreConfig {
    /// Loads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.log_level.trim().to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error"
        ) {
            return Err(ConfigError::Invalid(format!(
                "log_level `{}` is not one of trace|debug|info|warn|error",
                self.log_level
            )));
        }
        if let Some(log_dir) = self.log_dir.as_ref() {
            if !log_dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "log_dir must be absolute, got `{}`",
                    log_dir.display()
                )));
            }
        }
        if self.protected_session_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "protected_session_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.sync_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "sync_batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn protected_session_timeout(&self) -> Duration {
        Duration::from_secs(self.protected_session_timeout_secs)
    }
}
