//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use serde::Deserialize;

use crate::admin::AdminConfig;
use crate::consumer::ConsumerConfig;
use crate::identity::{InstanceId, LeaderElector, RunMode};
use crate::maintenance::MaintenanceConfig;
use crate::reconciler::ReconcilerConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTIDE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTIDE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTIDE_LOG";
/// Environment variable selecting the log format (`json` or `pretty`).
pub const LOG_FORMAT_ENV_VAR: &str = "EVENTIDE_LOG_FORMAT";
/// `redis.url` value selecting the in-process transport and store.
pub const MEMORY_URL: &str = "memory://";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration parameter: {0}")]
    MissingParameter(&'static str),

    #[error("An instance id is required in production; set instance_id, EVENTIDE_INSTANCE_ID or pm_id")]
    MissingInstanceId,

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Redis connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, or `memory://` for in-process backends.
    pub url: Option<String>,
    /// Prefix for every stream and version key.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "eventide".to_string(),
        }
    }
}

impl RedisConfig {
    pub fn is_memory(&self) -> bool {
        self.url.as_deref() == Some(MEMORY_URL)
    }
}

fn default_leader_instance_id() -> String {
    "0".to_string()
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: RunMode,
    /// Explicit instance id. Falls back to the process environment.
    pub instance_id: Option<String>,
    /// Instance id that holds the leader role in production.
    #[serde(default = "default_leader_instance_id")]
    pub leader_instance_id: String,
    pub redis: RedisConfig,
    pub admin: AdminConfig,
    pub consumer: ConsumerConfig,
    pub reconciler: ReconcilerConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            instance_id: None,
            leader_instance_id: default_leader_instance_id(),
            redis: RedisConfig::default(),
            admin: AdminConfig::default(),
            consumer: ConsumerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix and `__` separator
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Check everything the process needs before it touches a connection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self
            .redis
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingParameter("redis.url"))?;

        if url == MEMORY_URL && self.mode == RunMode::Production {
            return Err(ConfigError::Invalid(
                "the in-memory transport is only available in development".to_string(),
            ));
        }
        if self.consumer.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "consumer.batch_size must be at least 1".to_string(),
            ));
        }
        if self.maintenance.reclaim_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "maintenance.reclaim_batch_size must be at least 1".to_string(),
            ));
        }
        self.resolve_instance_id()?;
        Ok(())
    }

    /// Instance id from configuration or the process environment.
    pub fn resolve_instance_id(&self) -> Result<InstanceId, ConfigError> {
        InstanceId::resolve(self.mode, self.instance_id.as_deref())
    }

    pub fn leader_elector(&self) -> LeaderElector {
        LeaderElector::new(self.mode, self.leader_instance_id.clone())
    }

    /// In-memory development configuration.
    pub fn for_test() -> Self {
        Self {
            instance_id: Some("test_consumer".to_string()),
            redis: RedisConfig {
                url: Some(MEMORY_URL.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
