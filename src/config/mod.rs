//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on malformed values. In local dev
//! call `dotenvy::dotenv().ok()` first.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::queue::RetryPolicy;

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub controller: ControllerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            controller: ControllerConfig::from_env()?,
        })
    }
}

/// Settings for one controller instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub threadiness: usize,
    pub retry: RetryPolicy,
    /// How often cache readiness is polled during startup.
    pub sync_poll_interval: Duration,
    /// Give up on the initial cache sync after this long. `None` waits
    /// until stopped.
    pub sync_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            threadiness: 1,
            retry: RetryPolicy::default(),
            sync_poll_interval: Duration::from_millis(100),
            sync_timeout: None,
        }
    }
}

/// On-disk form. Durations are whole milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ControllerFile {
    threadiness: Option<usize>,
    retry_threshold: Option<u32>,
    base_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    sync_poll_interval_ms: Option<u64>,
    sync_timeout_ms: Option<u64>,
}

impl ControllerConfig {
    /// Read `RECONCILER_*` variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let file = ControllerFile {
            threadiness: optional_var("RECONCILER_THREADINESS")?,
            retry_threshold: optional_var("RECONCILER_RETRY_THRESHOLD")?,
            base_backoff_ms: optional_var("RECONCILER_BASE_BACKOFF_MS")?,
            max_backoff_ms: optional_var("RECONCILER_MAX_BACKOFF_MS")?,
            sync_poll_interval_ms: optional_var("RECONCILER_SYNC_POLL_INTERVAL_MS")?,
            sync_timeout_ms: optional_var("RECONCILER_SYNC_TIMEOUT_MS")?,
        };
        Self::default().merge(file).validated()
    }

    /// Parse a TOML file; missing fields keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad controller config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ControllerFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        Self::default().merge(file).validated()
    }

    fn merge(mut self, file: ControllerFile) -> Self {
        if let Some(n) = file.threadiness {
            self.threadiness = n;
        }
        if let Some(n) = file.retry_threshold {
            self.retry.retry_threshold = n;
        }
        if let Some(ms) = file.base_backoff_ms {
            self.retry.base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = file.max_backoff_ms {
            self.retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = file.sync_poll_interval_ms {
            self.sync_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.sync_timeout_ms {
            self.sync_timeout = Some(Duration::from_millis(ms));
        }
        self
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.threadiness == 0 {
            return Err(Error::Config("threadiness must be at least 1".to_string()));
        }
        if self.retry.base_backoff > self.retry.max_backoff {
            return Err(Error::Config(format!(
                "base backoff {:?} exceeds max backoff {:?}",
                self.retry.base_backoff, self.retry.max_backoff
            )));
        }
        if self.sync_poll_interval.is_zero() {
            return Err(Error::Config(
                "sync poll interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

fn optional_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
