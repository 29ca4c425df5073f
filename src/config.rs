//! Typed configuration.
//!
//! Process-level settings come from environment variables and fail fast if
//! required ones are missing; the Redis URL is held as a `SecretString` so
//! credentials embedded in it never reach the logs. Queue tuning comes from
//! an optional TOML file with every field defaulted.

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::gateway::{
    DEFAULT_DEDUPLICATION_TTL, DEFAULT_MESSAGE_WAIT_INTERVAL, GatewayOptions,
};
use crate::keys::DEFAULT_SEPARATOR;
use crate::retry::{self, RetryPolicy};

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub queue: QueueSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this. `RMQ_CONFIG`
    /// optionally points at a TOML file of [`QueueSettings`].
    pub fn from_env() -> Result<Self> {
        let queue = match std::env::var("RMQ_CONFIG") {
            Ok(path) => QueueSettings::load(path)?,
            Err(_) => QueueSettings::default(),
        };

        Ok(Self {
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            queue,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Per-queue behaviour and store tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    pub deduplication: bool,
    pub enable_completed_queue: bool,
    pub enable_failed_queue: bool,
    pub key_separator: String,
    pub deduplication_ttl_seconds: u64,
    pub message_wait_interval_seconds: u64,
    pub retry: RetrySettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            deduplication: true,
            enable_completed_queue: false,
            enable_failed_queue: false,
            key_separator: DEFAULT_SEPARATOR.to_string(),
            deduplication_ttl_seconds: DEFAULT_DEDUPLICATION_TTL.as_secs(),
            message_wait_interval_seconds: DEFAULT_MESSAGE_WAIT_INTERVAL.as_secs(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_elapsed_seconds: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: retry::DEFAULT_INITIAL_INTERVAL.as_millis() as u64,
            max_interval_ms: retry::DEFAULT_MAX_INTERVAL.as_millis() as u64,
            multiplier: retry::DEFAULT_MULTIPLIER,
            jitter: retry::DEFAULT_JITTER,
            max_elapsed_seconds: retry::DEFAULT_MAX_ELAPSED.as_secs(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .initial_interval(Duration::from_millis(self.initial_interval_ms))
            .max_interval(Duration::from_millis(self.max_interval_ms))
            .multiplier(self.multiplier)
            .jitter(self.jitter)
            .max_elapsed(Duration::from_secs(self.max_elapsed_seconds))
    }
}

impl QueueSettings {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(s).map_err(|e| Error::Config(format!("invalid queue settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.key_separator.is_empty() {
            return Err(Error::Config("key_separator must not be empty".into()));
        }
        if self.deduplication_ttl_seconds == 0 {
            return Err(Error::Config("deduplication_ttl_seconds must be positive".into()));
        }
        if self.message_wait_interval_seconds == 0 {
            return Err(Error::Config(
                "message_wait_interval_seconds must be positive".into(),
            ));
        }
        let retry = &self.retry;
        if retry.initial_interval_ms == 0 || retry.initial_interval_ms > retry.max_interval_ms {
            return Err(Error::Config(
                "retry.initial_interval_ms must be positive and at most max_interval_ms".into(),
            ));
        }
        if !(retry.multiplier >= 1.0 && retry.multiplier.is_finite()) {
            return Err(Error::Config("retry.multiplier must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(Error::Config("retry.jitter must be between 0 and 1".into()));
        }
        Ok(())
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            retry: self.retry.policy(),
            deduplication_ttl: Duration::from_secs(self.deduplication_ttl_seconds),
            message_wait_interval: Duration::from_secs(self.message_wait_interval_seconds),
        }
    }
}
