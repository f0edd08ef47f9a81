//! Configuration management for listbuffer
//!
//! Handles loading and validation of the buffer configuration file. YAML is
//! the default format; files ending in `.toml` are parsed as TOML.
//!
//! ```yaml
//! redis:
//!   host: localhost:6379
//!   in: QUEUE_IN
//!   out: QUEUE_OUT
//! tick: 1000
//! target_in: 10000
//! target_out: 5000
//! redis_chunk: 500
//! data_chunk: 100000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Highest database selector accepted (exclusive), matching a stock Redis build.
pub const MAX_REDIS_DB: u8 = 16;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Broker connection and queue keys
    #[serde(default)]
    pub redis: RedisConfig,

    /// SQLite chunk index path
    #[serde(default = "default_index_file")]
    pub index_file: PathBuf,

    /// Directory holding one file per chunk
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Tick period in milliseconds
    pub tick: u64,

    /// Desired in-queue depth
    pub target_in: u64,

    /// Desired out-queue depth
    pub target_out: u64,

    /// Items moved per broker pop/push
    pub redis_chunk: u64,

    /// Maximum items per chunk file
    pub data_chunk: u64,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Transport used to reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Tcp,
    Unix,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Unix => write!(f, "unix"),
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// `tcp` or `unix`
    #[serde(default)]
    pub network: NetworkMode,

    /// `host:port` for tcp, socket path for unix
    #[serde(default = "default_host")]
    pub host: String,

    /// AUTH password; empty skips authentication
    #[serde(default)]
    pub pass: String,

    /// Database selector
    #[serde(default)]
    pub db: u8,

    /// Key of the list producers push into
    #[serde(rename = "in", default = "default_in_key")]
    pub in_key: String,

    /// Key of the list consumers drain
    #[serde(rename = "out", default = "default_out_key")]
    pub out_key: String,

    /// Bound on connect and on each command round trip
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            network: NetworkMode::default(),
            host: default_host(),
            pass: String::new(),
            db: 0,
            in_key: default_in_key(),
            out_key: default_out_key(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl RedisConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_host() -> String {
    "localhost:6379".to_string()
}

fn default_in_key() -> String {
    "QUEUE_IN".to_string()
}

fn default_out_key() -> String {
    "QUEUE_OUT".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_index_file() -> PathBuf {
    PathBuf::from("./index.db")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/")
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

impl BufferConfig {
    /// Load and validate configuration from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config = if is_toml {
            Self::from_toml_str(&contents)?
        } else {
            Self::from_yaml_str(&contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without validating
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse TOML without validating
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.db >= MAX_REDIS_DB {
            return Err(ConfigError::ValidationError(format!(
                "invalid db number: {} (must be < {MAX_REDIS_DB})",
                self.redis.db
            )));
        }
        if self.redis.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "redis.host must not be empty".to_string(),
            ));
        }
        if self.redis.in_key.is_empty() || self.redis.out_key.is_empty() {
            return Err(ConfigError::ValidationError(
                "redis.in and redis.out must not be empty".to_string(),
            ));
        }
        if self.redis.in_key == self.redis.out_key {
            return Err(ConfigError::ValidationError(format!(
                "redis.in and redis.out must differ (both are {:?})",
                self.redis.in_key
            )));
        }
        if self.redis.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "redis.timeout_ms must be >= 1".to_string(),
            ));
        }
        if self.tick == 0 {
            return Err(ConfigError::ValidationError("tick must be >= 1".to_string()));
        }
        if self.redis_chunk == 0 {
            return Err(ConfigError::ValidationError(
                "redis_chunk must be >= 1".to_string(),
            ));
        }
        if self.data_chunk == 0 {
            return Err(ConfigError::ValidationError(
                "data_chunk must be >= 1".to_string(),
            ));
        }
        let limit = i64::MAX as u64;
        if self.target_in > limit || self.target_out > limit || self.redis_chunk > limit {
            return Err(ConfigError::ValidationError(
                "target_in, target_out and redis_chunk must fit in a signed 64-bit integer"
                    .to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick)
    }
}
