//! Configuration loader with environment variable expansion

use super::{Config, ConfigError};
use lazy_static::lazy_static;
use std::path::Path;

lazy_static! {
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
}

/// Expand environment variables in a string.
///
/// Supports `${VAR_NAME}`, which keeps the placeholder if the variable is
/// unset, and `${VAR_NAME:-default}`.
pub fn expand_env_vars(s: &str) -> String {
    ENV_VAR
        .replace_all(s, |cap: &regex_lite::Captures<'_>| {
            match std::env::var(&cap[1]) {
                Ok(value) => value,
                Err(_) => match cap.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => cap[0].to_string(),
                },
            }
        })
        .into_owned()
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let config = Self::load_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file without validating it.
    ///
    /// For callers that layer overrides on top and call
    /// [`Config::validate`] afterwards.
    pub fn load_unvalidated<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_unvalidated(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let config = Self::parse_unvalidated(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text without validating it
    pub fn parse_unvalidated(content: &str) -> Result<Config, ConfigError> {
        let expanded = expand_env_vars(content);
        // An empty document deserializes as null
        if expanded.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(&expanded)?)
    }
}
