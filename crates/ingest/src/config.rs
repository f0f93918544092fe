//! Static ingestion configuration.
//!
//! Loaded once at process start from TOML and immutable afterwards.
//! Durations are written in seconds and may be fractional:
//!
//! ```toml
//! fetch_timeout = 20
//! max_market_price = 100000
//!
//! [[sources]]
//! name = "justtcg"
//! requests_per_window = 4
//! window_duration = 3600
//! failure_threshold = 3
//! recovery_timeout = 30
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::models::PriceSource;

const DEFAULT_REQUESTS_PER_WINDOW: u32 = 60;
const DEFAULT_WINDOW_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_MARKET_PRICE: u64 = 100_000;
/// Upper bound for every configured duration.
const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Resilience settings for one source.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ServiceEndpointConfig {
    pub name: PriceSource,
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    #[serde(default = "default_window_duration", with = "secs")]
    pub window_duration: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout", with = "secs")]
    pub recovery_timeout: Duration,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_backoff", with = "secs")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "secs")]
    pub max_backoff: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl ServiceEndpointConfig {
    /// Settings for `name` with the conservative defaults.
    pub fn new(name: PriceSource) -> Self {
        Self {
            name,
            requests_per_window: DEFAULT_REQUESTS_PER_WINDOW,
            window_duration: DEFAULT_WINDOW_DURATION,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    pub fn with_rate_limit(mut self, requests_per_window: u32, window_duration: Duration) -> Self {
        self.requests_per_window = requests_per_window;
        self.window_duration = window_duration;
        self
    }

    pub fn with_circuit(
        mut self,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        self.failure_threshold = failure_threshold;
        self.recovery_timeout = recovery_timeout;
        self.success_threshold = success_threshold;
        self
    }

    pub fn with_retry(
        mut self,
        max_retry_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        self.max_retry_attempts = max_retry_attempts;
        self.initial_backoff = initial_backoff;
        self.max_backoff = max_backoff;
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| Err(ConfigError::Invalid(format!("{}: {}", self.name, what)));

        if self.requests_per_window == 0 {
            return invalid("requests_per_window must be at least 1");
        }
        if self.window_duration.is_zero() {
            return invalid("window_duration must be positive");
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold must be at least 1");
        }
        if self.success_threshold == 0 {
            return invalid("success_threshold must be at least 1");
        }
        if self.max_retry_attempts == 0 {
            return invalid("max_retry_attempts must be at least 1");
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return invalid("backoff_multiplier must be a finite value >= 1.0");
        }
        if self.initial_backoff > self.max_backoff {
            return invalid("initial_backoff must not exceed max_backoff");
        }
        if [self.window_duration, self.recovery_timeout, self.max_backoff]
            .iter()
            .any(|d| *d > MAX_DURATION)
        {
            return invalid("durations must not exceed one year");
        }
        Ok(())
    }
}

/// Top-level ingestion configuration.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct IngestConfig {
    /// Deadline for a single `fetch` call.
    #[serde(default = "default_fetch_timeout", with = "secs")]
    pub fetch_timeout: Duration,
    /// Worker limit per `ingest` call. Defaults to the number of requested sources.
    #[serde(default)]
    pub max_concurrent_sources: Option<usize>,
    /// Sanity ceiling for any price, in currency units.
    #[serde(default = "default_max_market_price")]
    pub max_market_price: u64,
    #[serde(default)]
    pub sources: Vec<ServiceEndpointConfig>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_concurrent_sources: None,
            max_market_price: DEFAULT_MAX_MARKET_PRICE,
            sources: Vec::new(),
        }
    }
}

impl IngestConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout.is_zero() || self.fetch_timeout > MAX_DURATION {
            return Err(ConfigError::Invalid(
                "fetch_timeout must be positive and at most one year".into(),
            ));
        }
        if self.max_concurrent_sources == Some(0) {
            return Err(ConfigError::Invalid(
                "max_concurrent_sources must be at least 1".into(),
            ));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name) {
                return Err(ConfigError::Invalid(format!(
                    "source '{}' configured more than once",
                    source.name
                )));
            }
            source.validate()?;
        }
        Ok(())
    }

    pub fn source(&self, name: PriceSource) -> Option<&ServiceEndpointConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Add default settings for `name` unless it is already configured.
    pub fn ensure_source(&mut self, name: PriceSource) -> &ServiceEndpointConfig {
        match self.sources.iter().position(|s| s.name == name) {
            Some(index) => &self.sources[index],
            None => {
                self.sources.push(ServiceEndpointConfig::new(name));
                &self.sources[self.sources.len() - 1]
            }
        }
    }
}

fn default_requests_per_window() -> u32 {
    DEFAULT_REQUESTS_PER_WINDOW
}
fn default_window_duration() -> Duration {
    DEFAULT_WINDOW_DURATION
}
fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}
fn default_recovery_timeout() -> Duration {
    DEFAULT_RECOVERY_TIMEOUT
}
fn default_success_threshold() -> u32 {
    DEFAULT_SUCCESS_THRESHOLD
}
fn default_max_retry_attempts() -> u32 {
    DEFAULT_MAX_RETRY_ATTEMPTS
}
fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}
fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}
fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}
fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}
fn default_max_market_price() -> u64 {
    DEFAULT_MAX_MARKET_PRICE
}

/// Durations as (fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| D::Error::custom(format!("invalid duration: {} seconds", secs)))
    }
}
