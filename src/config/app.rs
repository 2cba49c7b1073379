//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alert::AlertConfig;
use crate::backoff::BackoffPolicy;
use crate::fanout::FanoutConfig;
use crate::ingest::PipelineConfig;
use crate::query::QueryConfig;
use crate::rules::DEFAULT_CACHE_TTL;
use crate::storage::db::DEFAULT_MAX_CONNECTIONS;
use crate::stream::DEFAULT_STREAM_CAPACITY;

use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

pub const DEFAULT_PORT: u16 = 8000;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/temporallayr.db";

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_stream_capacity() -> usize {
    DEFAULT_STREAM_CAPACITY
}

// =============================================================================
// Sections
// =============================================================================

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite://path`, `sqlite::memory:` or `memory:`.
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Retry schedule for the initial connection.
    #[serde(default)]
    pub connect_retry: BackoffPolicy,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_retry: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// How long a tenant's rule list is served from cache.
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_capacity")]
    pub capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ingestion: PipelineConfig,
    pub rules: RulesConfig,
    pub alerts: AlertConfig,
    pub fanout: FanoutConfig,
    pub stream: StreamConfig,
    pub query: QueryConfig,
}

impl AppConfig {
    /// Load, expand `${VAR:-default}` references, parse and validate.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(raw)?;
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `ConfigError::ValidationError` naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::invalid(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server port must be non-zero"));
        }

        if self.database.url.trim().is_empty() {
            return Err(ConfigError::invalid("database url must be set"));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid(
                "database max_connections must be positive",
            ));
        }

        let ingest = &self.ingestion;
        if ingest.max_batch_size == 0 {
            return Err(ConfigError::invalid(
                "ingestion max_batch_size must be positive",
            ));
        }
        if ingest.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "ingestion queue_capacity must be positive",
            ));
        }
        if ingest.flush_interval.is_zero() {
            return Err(ConfigError::invalid(
                "ingestion flush_interval must be positive",
            ));
        }

        if self.alerts.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "alerts retry max_attempts must be positive",
            ));
        }
        if self.fanout.queue_capacity == 0 {
            return Err(ConfigError::invalid("fanout queue_capacity must be positive"));
        }
        if self.fanout.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid(
                "fanout heartbeat_interval must be positive",
            ));
        }
        if self.stream.capacity == 0 {
            return Err(ConfigError::invalid("stream capacity must be positive"));
        }

        let query = &self.query;
        if query.default_limit > query.max_limit {
            return Err(ConfigError::invalid(format!(
                "query default_limit ({}) exceeds max_limit ({})",
                query.default_limit, query.max_limit
            )));
        }
        if query.page_size == 0 {
            return Err(ConfigError::invalid("query page_size must be positive"));
        }

        Ok(())
    }
}
