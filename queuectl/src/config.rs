//! Runtime configuration read by workers.
//!
//! The engine only reads configuration through a [`ConfigProvider`], a small key value store over
//! the fixed set of [`ConfigKey`]s. Two providers are included:
//!
//! - [`JsonFileConfig`] persisting values in a JSON object on disk, re-read on every lookup so
//!   changes made while workers are running are picked up by the next execution.
//! - [`InMemoryConfig`] for tests and embedding.
//!
//! # Example
//!
//! ```
//! # use queuectl::prelude::*;
//! let config = InMemoryConfig::default();
//! assert_eq!(config.max_retries().unwrap(), 3);
//!
//! config.set(ConfigKey::MaxRetries, "5").unwrap();
//! assert_eq!(config.max_retries().unwrap(), 5);
//!
//! assert!(config.set(ConfigKey::BackoffBase, "0").is_err());
//! ```

use std::{
    collections::BTreeMap,
    fmt::Display,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    sync::RwLock,
    time::Duration,
};

use chrono::TimeDelta;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::retry::{RetryPolicy, DEFAULT_BACKOFF_BASE};

/// The recognised configuration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigKey {
    /// Retry allowance applied to submissions that do not specify one.
    MaxRetries,
    /// Base of the exponential delay between attempts, at least 1.
    BackoffBase,
    /// Per execution wall clock limit in seconds, 0 disables it.
    JobTimeout,
    /// Cap on the delay between attempts in seconds, 0 leaves it uncapped.
    MaxBackoff,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [
        Self::MaxRetries,
        Self::BackoffBase,
        Self::JobTimeout,
        Self::MaxBackoff,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MaxRetries => "max_retries",
            Self::BackoffBase => "backoff_base",
            Self::JobTimeout => "job_timeout",
            Self::MaxBackoff => "max_backoff",
        }
    }

    pub const fn default_value(&self) -> u64 {
        match self {
            Self::MaxRetries => 3,
            Self::BackoffBase => DEFAULT_BACKOFF_BASE as u64,
            Self::JobTimeout | Self::MaxBackoff => 0,
        }
    }

    /// Whether `0`, `null` and the empty string mean "disabled" for this key.
    const fn is_optional(&self) -> bool {
        matches!(self, Self::JobTimeout | Self::MaxBackoff)
    }

    fn check(&self, value: u64) -> Result<u64, ConfigError> {
        let valid = match self {
            Self::MaxRetries => u32::try_from(value).is_ok(),
            Self::BackoffBase => value >= 1 && u32::try_from(value).is_ok(),
            Self::JobTimeout | Self::MaxBackoff => i64::try_from(value).is_ok(),
        };
        if valid {
            Ok(value)
        } else {
            Err(ConfigError::invalid(*self, value))
        }
    }

    /// Parses a value given as text, e.g. from a command line.
    fn parse(&self, raw: &str) -> Result<u64, ConfigError> {
        let raw = raw.trim();
        if self.is_optional() && (raw.is_empty() || raw == "null") {
            return Ok(0);
        }
        raw.parse::<u64>()
            .map_err(|_| ConfigError::invalid(*self, raw))
            .and_then(|value| self.check(value))
    }

    /// Reads a value as stored in a JSON document.
    ///
    /// Numbers and numeric strings are accepted, `null` falls back to the default.
    fn from_json(&self, value: &Value) -> Result<u64, ConfigError> {
        match value {
            Value::Null => Ok(self.default_value()),
            Value::Number(number) => number
                .as_u64()
                .ok_or_else(|| ConfigError::invalid(*self, number))
                .and_then(|value| self.check(value)),
            Value::String(raw) if raw.trim().is_empty() => Ok(self.default_value()),
            Value::String(raw) => self.parse(raw),
            other => Err(ConfigError::invalid(*self, other)),
        }
    }
}

impl Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_owned()))
    }
}

/// Errors that can occur reading or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: ConfigKey, value: String },
    #[error("Failed to access the configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse the configuration file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Configuration is in a bad state")]
    BadState,
}

impl ConfigError {
    fn invalid(key: ConfigKey, value: impl Display) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_string(),
        }
    }
}

/// A key value store over the recognised [`ConfigKey`]s.
///
/// [`ConfigProvider::get`] always yields a value, falling back to the key's default.
pub trait ConfigProvider: Send + Sync {
    fn get(&self, key: ConfigKey) -> Result<u64, ConfigError>;

    /// Validates and stores a value given as text.
    fn set(&self, key: ConfigKey, value: &str) -> Result<(), ConfigError>;
}

/// Typed accessors over any [`ConfigProvider`].
pub trait ConfigProviderExt: ConfigProvider {
    fn max_retries(&self) -> Result<u32, ConfigError> {
        let value = self.get(ConfigKey::MaxRetries)?;
        u32::try_from(value).map_err(|_| ConfigError::invalid(ConfigKey::MaxRetries, value))
    }

    fn backoff_base(&self) -> Result<u32, ConfigError> {
        let value = self.get(ConfigKey::BackoffBase)?;
        match u32::try_from(value) {
            Ok(base) if base >= 1 => Ok(base),
            _ => Err(ConfigError::invalid(ConfigKey::BackoffBase, value)),
        }
    }

    /// The per execution timeout, [`None`] when disabled.
    fn job_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        let seconds = self.get(ConfigKey::JobTimeout)?;
        Ok((seconds > 0).then_some(Duration::from_secs(seconds)))
    }

    /// The cap on the delay between attempts, [`None`] when uncapped.
    fn max_backoff(&self) -> Result<Option<TimeDelta>, ConfigError> {
        let seconds = self.get(ConfigKey::MaxBackoff)?;
        if seconds == 0 {
            return Ok(None);
        }
        i64::try_from(seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(ConfigKey::MaxBackoff, seconds))
    }

    /// The [`RetryPolicy`] currently configured.
    fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let policy = RetryPolicy::new(self.backoff_base()?);
        Ok(match self.max_backoff()? {
            Some(max) => policy.with_max_backoff(max),
            None => policy,
        })
    }
}

impl<T: ConfigProvider + ?Sized> ConfigProviderExt for T {}

/// Configuration persisted as a JSON object in a file.
///
/// A missing file yields the defaults. Keys that are not recognised are preserved on write.
#[derive(Debug, Clone)]
pub struct JsonFileConfig {
    path: PathBuf,
}

impl JsonFileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map<String, Value>, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(Map::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Map::new()),
            Err(error) => Err(error.into()),
        }
    }

    fn save(&self, values: &Map<String, Value>) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = serde_json::to_string_pretty(values)?;
        contents.push('\n');
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl ConfigProvider for JsonFileConfig {
    fn get(&self, key: ConfigKey) -> Result<u64, ConfigError> {
        match self.load()?.get(key.as_str()) {
            Some(value) => key.from_json(value),
            None => Ok(key.default_value()),
        }
    }

    fn set(&self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        let value = key.parse(value)?;
        let mut values = self.load()?;
        values.insert(key.as_str().to_owned(), Value::from(value));
        self.save(&values)
    }
}

/// Configuration held in memory.
#[derive(Debug, Default)]
pub struct InMemoryConfig {
    values: RwLock<BTreeMap<ConfigKey, u64>>,
}

impl InMemoryConfig {
    /// Builder style [`ConfigProvider::set`].
    pub fn with(self, key: ConfigKey, value: &str) -> Result<Self, ConfigError> {
        self.set(key, value)?;
        Ok(self)
    }
}

impl ConfigProvider for InMemoryConfig {
    fn get(&self, key: ConfigKey) -> Result<u64, ConfigError> {
        let values = self.values.read().map_err(|_| ConfigError::BadState)?;
        Ok(values.get(&key).copied().unwrap_or(key.default_value()))
    }

    fn set(&self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        let value = key.parse(value)?;
        self.values
            .write()
            .map_err(|_| ConfigError::BadState)?
            .insert(key, value);
        Ok(())
    }
}
