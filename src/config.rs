//! Configuration system for the gateway
//!
//! Provides defaults, a builder, environment overrides and TOML loading for
//! the cache, retry and metrics services.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GateError, Result};

pub const ENV_CACHE_DIR: &str = "MDGATE_CACHE_DIR";
pub const ENV_CACHE_TTL_SECS: &str = "MDGATE_CACHE_TTL_SECS";
pub const ENV_METRICS_ENABLED: &str = "MDGATE_METRICS_ENABLED";
pub const ENV_MAX_RETRIES: &str = "MDGATE_MAX_RETRIES";
pub const ENV_LOG_LEVEL: &str = "MDGATE_LOG_LEVEL";

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Response cache configuration
    pub cache: CacheConfig,

    /// Retry configuration
    pub retry: RetryConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Log filter directive, e.g. `info` or `tower_mdgate=debug`
    pub log_level: String,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one JSON file per entry
    pub dir: PathBuf,

    /// TTL applied when `set` is called without one
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            default_ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,

    /// Delay before the first retry; doubled on each further attempt
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,

    /// Upper bound on the un-jittered delay
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,

    /// Scale each delay by a random factor in [0.5, 1.5]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Global switch; a disabled collector ignores every record call
    pub enabled: bool,

    /// Latency samples retained per operation for percentiles
    pub max_latency_samples: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_latency_samples: 1000,
        }
    }
}

impl MetricsConfig {
    /// Default config with the enable switch taken from `MDGATE_METRICS_ENABLED`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(flag) = std::env::var(ENV_METRICS_ENABLED) {
            config.enabled = parse_enabled(&flag);
        }
        config
    }
}

fn parse_enabled(flag: &str) -> bool {
    flag.trim().eq_ignore_ascii_case("true")
}

/// Configuration builder
pub struct ConfigBuilder {
    config: GateConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: GateConfig {
                log_level: "info".to_string(),
                ..Default::default()
            },
        }
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache.dir = dir.into();
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache.default_ttl = ttl;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.retry.jitter = enabled;
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.metrics.enabled = enabled;
        self
    }

    pub fn max_latency_samples(mut self, samples: usize) -> Self {
        self.config.metrics.max_latency_samples = samples;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn build(self) -> GateConfig {
        self.config
    }
}

/// Load configuration from environment variables
pub fn from_env() -> GateConfig {
    let mut config = ConfigBuilder::new().build();

    if let Ok(dir) = std::env::var(ENV_CACHE_DIR) {
        config.cache.dir = PathBuf::from(dir);
    }

    if let Ok(ttl) = std::env::var(ENV_CACHE_TTL_SECS) {
        if let Ok(secs) = ttl.parse::<u64>() {
            config.cache.default_ttl = Duration::from_secs(secs);
        }
    }

    if let Ok(flag) = std::env::var(ENV_METRICS_ENABLED) {
        config.metrics.enabled = parse_enabled(&flag);
    }

    if let Ok(retries) = std::env::var(ENV_MAX_RETRIES) {
        if let Ok(n) = retries.parse::<usize>() {
            config.retry.max_retries = n;
        }
    }

    if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
        config.log_level = level.to_lowercase();
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<Path>) -> Result<GateConfig> {
    let contents = std::fs::read_to_string(path)?;
    from_toml_str(&contents)
}

pub fn from_toml_str(contents: &str) -> Result<GateConfig> {
    let mut config: GateConfig = toml::from_str(contents).map_err(|e| GateError::Config {
        message: e.to_string(),
    })?;
    if config.log_level.is_empty() {
        config.log_level = "info".to_string();
    }
    Ok(config)
}

/// Durations as (possibly fractional) seconds in config files.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
