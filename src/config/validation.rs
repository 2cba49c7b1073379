//! Config error type and parsing helpers.

use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Parse a human duration such as `30s`, `5m`, `1h30m` or `7d`.
///
/// ```
/// use temporallayr::config::parse_duration;
///
/// assert_eq!(parse_duration("1h").unwrap().as_secs(), 3600);
/// assert!(parse_duration("soon").is_err());
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env var pattern is valid")
});

/// Substitute `${VAR}` and `${VAR:-default}` references from the process
/// environment.
///
/// A `${VAR}` reference with no default and no such variable is an error,
/// naming every missing variable.
pub fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = Vec::new();
    let expanded = ENV_VAR.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        match (std::env::var(name), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    let expanded = expanded.into_owned();

    if missing.is_empty() {
        Ok(expanded)
    } else {
        missing.dedup();
        Err(ConfigError::invalid(format!(
            "unset environment variable(s): {}",
            missing.join(", ")
        )))
    }
}
