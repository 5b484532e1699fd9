//! Configuration module for cmd2s3
//!
//! Handles loading and parsing of the optional YAML configuration file with
//! support for environment variable expansion and validation. Every section
//! has defaults, so an empty file (or no file) is a valid configuration.

use crate::storage::{Encryption, UploadOptions};
use crate::upload::multipart::{DEFAULT_PART_SIZE, MAX_PART_SIZE, MIN_PART_SIZE};
use crate::upload::{chunker::DEFAULT_QUEUE_DEPTH, UploadSettings};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::{expand_env_vars, ConfigLoader};

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Parse a byte size such as `8388608`, `64M`, `100MiB` or `1G`.
///
/// Suffixes are binary (K = 1024).
pub fn parse_byte_size(input: &str) -> Result<usize, ConfigError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    let value: usize = digits
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("Invalid size '{}'", input)))?;

    let multiplier: usize = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        other => {
            return Err(ConfigError::ValidationError(format!(
                "Invalid size suffix '{}' in '{}'",
                other, input
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::ValidationError(format!("Size '{}' is too large", input)))
}

/// Accept either a plain byte count or a size string such as `64M`
fn deserialize_byte_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ByteSize {
        Bytes(usize),
        Text(String),
    }

    match ByteSize::deserialize(deserializer)? {
        ByteSize::Bytes(bytes) => Ok(bytes),
        ByteSize::Text(text) => parse_byte_size(&text).map_err(serde::de::Error::custom),
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Load configuration from a file, leaving validation to the caller
    pub fn load_unvalidated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load_unvalidated(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref endpoint) = self.s3.endpoint {
            if !is_valid_http_url(endpoint) {
                return Err(ConfigError::ValidationError(
                    "Invalid S3 endpoint: must start with http:// or https://".into(),
                ));
            }
        }

        if self.s3.access_key.is_some() != self.s3.secret_key.is_some() {
            return Err(ConfigError::ValidationError(
                "access_key and secret_key must be set together".into(),
            ));
        }

        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&self.upload.part_size) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid part_size {}: must be between {} and {} bytes",
                self.upload.part_size, MIN_PART_SIZE, MAX_PART_SIZE
            )));
        }

        if self.upload.queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "queue_depth must be at least 1".into(),
            ));
        }

        // Validate server-side encryption
        self.upload.encryption()?;

        match self.logging.format.as_str() {
            "text" | "json" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format '{}': must be 'text' or 'json'",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Pipeline settings derived from the upload section
    pub fn upload_settings(&self) -> Result<UploadSettings, ConfigError> {
        Ok(UploadSettings {
            part_size: self.upload.part_size,
            queue_depth: self.upload.queue_depth,
            options: UploadOptions {
                server_side_encryption: self.upload.encryption()?,
                content_type: self.upload.content_type.clone(),
            },
        })
    }
}

/// S3 backend configuration
///
/// Unset values fall back to the AWS environment/profile chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Use `endpoint/bucket/key` addressing, needed by most S3-compatible stores
    #[serde(default)]
    pub force_path_style: bool,
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(
        default = "default_part_size",
        deserialize_with = "deserialize_byte_size"
    )]
    pub part_size: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// `AES256`, `aws:kms` or `none`
    #[serde(default = "default_server_side_encryption")]
    pub server_side_encryption: String,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl UploadConfig {
    /// Parsed server-side encryption directive
    pub fn encryption(&self) -> Result<Option<Encryption>, ConfigError> {
        match self.server_side_encryption.as_str() {
            "AES256" => Ok(Some(Encryption::Aes256)),
            "aws:kms" => Ok(Some(Encryption::AwsKms {
                key_id: self.kms_key_id.clone(),
            })),
            "none" => Ok(None),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid server_side_encryption '{}': must be 'AES256', 'aws:kms' or 'none'",
                other
            ))),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            queue_depth: default_queue_depth(),
            server_side_encryption: default_server_side_encryption(),
            kms_key_id: None,
            content_type: None,
        }
    }
}

fn default_part_size() -> usize {
    DEFAULT_PART_SIZE
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_server_side_encryption() -> String {
    "AES256".to_string()
}

/// Logging configuration
///
/// `RUST_LOG` takes precedence over `level` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
