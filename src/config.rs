use std::env;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keystore::DEFAULT_KEY_ID;
use crate::pow::MAX_DIFFICULTY;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    // Backend
    pub backend_url: String,
    pub bearer_token: Option<String>,
    pub http_timeout_ms: u64,

    // Key storage
    pub key_dir: PathBuf,
    pub key_id: String,

    // Proof of work
    pub pow_difficulty: u32,
    pub pow_deadline_ms: Option<u64>,

    // Caller-side retry of whole bootstrap runs
    pub max_retries: u32,
    pub retry_delay_ms: u64,

    // Monitoring and logging
    pub log_level: String,
    pub metrics_enabled: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("backend_url", &self.backend_url)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("http_timeout_ms", &self.http_timeout_ms)
            .field("key_dir", &self.key_dir)
            .field("key_id", &self.key_id)
            .field("pow_difficulty", &self.pow_difficulty)
            .field("pow_deadline_ms", &self.pow_deadline_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("log_level", &self.log_level)
            .field("metrics_enabled", &self.metrics_enabled)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8080".to_string(),
            bearer_token: None,
            http_timeout_ms: 15000,

            key_dir: PathBuf::from(".device-auth"),
            key_id: DEFAULT_KEY_ID.to_string(),

            pow_difficulty: 6,
            pow_deadline_ms: None,

            max_retries: 3,
            retry_delay_ms: 1000,

            log_level: "info".to_string(),
            metrics_enabled: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any variable source; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(val) = lookup("DEVICE_AUTH_BACKEND_URL") {
            config.backend_url = val;
        }

        if let Some(val) = lookup("DEVICE_AUTH_BEARER_TOKEN") {
            if !val.is_empty() {
                config.bearer_token = Some(val);
            }
        }

        if let Some(val) = lookup("DEVICE_AUTH_HTTP_TIMEOUT_MS") {
            config.http_timeout_ms = parse("DEVICE_AUTH_HTTP_TIMEOUT_MS", val)?;
        }

        if let Some(val) = lookup("DEVICE_AUTH_KEY_DIR") {
            config.key_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("DEVICE_AUTH_KEY_ID") {
            config.key_id = val;
        }

        if let Some(val) = lookup("DEVICE_AUTH_POW_DIFFICULTY") {
            config.pow_difficulty = parse("DEVICE_AUTH_POW_DIFFICULTY", val)?;
        }

        if let Some(val) = lookup("DEVICE_AUTH_POW_DEADLINE_MS") {
            config.pow_deadline_ms = Some(parse("DEVICE_AUTH_POW_DEADLINE_MS", val)?);
        }

        if let Some(val) = lookup("DEVICE_AUTH_MAX_RETRIES") {
            config.max_retries = parse("DEVICE_AUTH_MAX_RETRIES", val)?;
        }

        if let Some(val) = lookup("DEVICE_AUTH_RETRY_DELAY_MS") {
            config.retry_delay_ms = parse("DEVICE_AUTH_RETRY_DELAY_MS", val)?;
        }

        if let Some(val) = lookup("LOG_LEVEL") {
            config.log_level = val;
        }

        if let Some(val) = lookup("METRICS_ENABLED") {
            config.metrics_enabled = val == "1";
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backend_url.starts_with("http") {
            return Err(ConfigError::ValidationError("DEVICE_AUTH_BACKEND_URL must be a valid HTTP URL".to_string()));
        }

        if self.pow_difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::ValidationError(format!(
                "DEVICE_AUTH_POW_DIFFICULTY must be at most {MAX_DIFFICULTY}"
            )));
        }

        if self.key_id.is_empty() {
            return Err(ConfigError::ValidationError("DEVICE_AUTH_KEY_ID must not be empty".to_string()));
        }

        if self.http_timeout_ms == 0 {
            return Err(ConfigError::ValidationError("DEVICE_AUTH_HTTP_TIMEOUT_MS must be greater than 0".to_string()));
        }

        if self.pow_deadline_ms == Some(0) {
            return Err(ConfigError::ValidationError("DEVICE_AUTH_POW_DEADLINE_MS must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// The higher-level credential `/dev/init` is authorized with.
    pub fn require_bearer_token(&self) -> Result<&str, ConfigError> {
        self.bearer_token
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("DEVICE_AUTH_BEARER_TOKEN".to_string()))
    }

    pub fn get_http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn get_pow_deadline(&self) -> Option<Duration> {
        self.pow_deadline_ms.map(Duration::from_millis)
    }

    pub fn get_retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn parse<T: std::str::FromStr>(key: &str, val: String) -> Result<T, ConfigError> {
    val.parse()
        .map_err(|_| ConfigError::InvalidEnvVar(key.to_string(), val))
}
