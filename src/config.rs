use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;

use crate::worker::WorkerSettings;

pub const DEFAULT_STATE_DIR: &str = ".actionist";
pub const DEFAULT_KEY_PREFIX: &str = "todo";
pub const DEFAULT_OWNER: &str = "me";

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Toml(toml::de::Error),
    InvalidTimeZone(String),
    InvalidValue { field: &'static str, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, err) => {
                write!(f, "cannot read config '{}': {}", path.display(), err)
            }
            ConfigError::Toml(err) => write!(f, "invalid config TOML: {}", err),
            ConfigError::InvalidTimeZone(zone) => {
                write!(f, "unknown time zone '{}', expected an IANA name", zone)
            }
            ConfigError::InvalidValue { field, message } => {
                write!(f, "invalid config value for '{}': {}", field, message)
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(_, err) => Some(err),
            ConfigError::Toml(err) => Some(err),
            ConfigError::InvalidTimeZone(_) => None,
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        ConfigError::Toml(value)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    timezone: Option<String>,
    db_path: Option<PathBuf>,
    volatile_path: Option<PathBuf>,
    key_prefix: Option<String>,
    owner: Option<String>,
    #[serde(default)]
    worker: RawWorker,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorker {
    poll_interval_secs: Option<u64>,
    max_attempts: Option<u32>,
    retry_backoff_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub timezone: Tz,
    pub db_path: PathBuf,
    pub volatile_path: PathBuf,
    pub key_prefix: String,
    pub owner: String,
    pub worker: WorkerSettings,
}

/// Command-line and environment values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub db_path: Option<PathBuf>,
    pub volatile_path: Option<PathBuf>,
    pub timezone: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = Path::new(DEFAULT_STATE_DIR);
        Self {
            timezone: chrono_tz::America::New_York,
            db_path: state_dir.join("actionist.db"),
            volatile_path: state_dir.join("volatile.db"),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            owner: DEFAULT_OWNER.to_string(),
            worker: WorkerSettings::default(),
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        Path::new(DEFAULT_STATE_DIR).join("config.toml")
    }

    /// A missing file is not an error; every field has a default.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(ConfigError::Io(path.to_path_buf(), err)),
        }
    }

    pub(crate) fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let file: RawConfig = toml::from_str(raw)?;
        let defaults = Self::default();

        let timezone = match file.timezone {
            Some(zone) => parse_timezone(&zone)?,
            None => defaults.timezone,
        };
        let key_prefix = match file.key_prefix {
            Some(prefix) => non_empty("key_prefix", prefix)?,
            None => defaults.key_prefix,
        };
        let owner = match file.owner {
            Some(owner) => non_empty("owner", owner)?,
            None => defaults.owner,
        };

        let mut worker = defaults.worker;
        if let Some(secs) = file.worker.poll_interval_secs {
            worker.poll_interval = Duration::from_secs(positive("worker.poll_interval_secs", secs)?);
        }
        if let Some(attempts) = file.worker.max_attempts {
            worker.max_attempts = u32::try_from(positive("worker.max_attempts", attempts.into())?)
                .unwrap_or(u32::MAX);
        }
        if let Some(secs) = file.worker.retry_backoff_secs {
            worker.retry_backoff = Duration::from_secs(positive("worker.retry_backoff_secs", secs)?);
        }

        Ok(Self {
            timezone,
            db_path: file.db_path.unwrap_or(defaults.db_path),
            volatile_path: file.volatile_path.unwrap_or(defaults.volatile_path),
            key_prefix,
            owner,
            worker,
        })
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(path) = overrides.db_path {
            self.db_path = path;
        }
        if let Some(path) = overrides.volatile_path {
            self.volatile_path = path;
        }
        if let Some(zone) = overrides.timezone {
            self.timezone = parse_timezone(&zone)?;
        }
        Ok(())
    }

    /// Lives next to the durable database so one lock guards one queue.
    pub fn worker_lock_path(&self) -> PathBuf {
        match self.db_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join("worker.lock"),
            _ => PathBuf::from("worker.lock"),
        }
    }
}

pub fn parse_timezone(raw: &str) -> Result<Tz, ConfigError> {
    raw.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::InvalidTimeZone(raw.to_string()))
}

fn non_empty(field: &'static str, value: String) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidValue {
            field,
            message: "must not be empty".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

fn positive(field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
