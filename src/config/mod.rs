//! YAML application configuration.
//!
//! One file configures the listener, the storage backend and every engine
//! component. `${VAR}` / `${VAR:-default}` references are expanded from the
//! environment before parsing; durations use humantime notation (`2s`,
//! `500ms`, `24h`).

mod app;
mod validation;

pub use app::{
    AppConfig, DEFAULT_DATABASE_URL, DEFAULT_PORT, DatabaseConfig, RulesConfig, ServerConfig,
    StreamConfig,
};
pub use validation::{ConfigError, expand_env_vars, parse_duration};
