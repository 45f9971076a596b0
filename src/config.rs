/*!
 * Configuration for resilience stacks
 *
 * A `ResilienceConfig` is a TOML document with one optional table per
 * decorator. A table that is absent leaves that decorator out of the stack.
 * Durations are written as integer milliseconds.
 *
 * ```toml
 * [logging]
 * level = "debug"
 * format = "json"
 *
 * [circuit_breaker]
 * failure_threshold = 3
 * recovery_timeout_ms = 30000
 *
 * [retry]
 * max_attempts = 4
 * transient_only = true
 * ```
 */

use crate::error::{ConfigError, Result};
use bulwark_core_processor::ProcessorError;
use bulwark_core_resilience::{
    BatchConfig, CacheConfig, CircuitBreakerConfig, RateLimiterConfig, RetryConfig, TimeoutConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batching: Option<BatchingSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSection>,
}

impl ResilienceConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = self.to_toml_string()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::io(path, e))
    }

    /// Every decorator enabled with its defaults
    pub fn all_defaults() -> Self {
        Self {
            logging: LoggingConfig::default(),
            circuit_breaker: Some(CircuitBreakerSection::default()),
            rate_limiter: Some(RateLimiterSection::default()),
            cache: Some(CacheSection::default()),
            batching: Some(BatchingSection::default()),
            retry: Some(RetrySection::default()),
            timeout: Some(TimeoutSection::default()),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output
    #[default]
    Compact,
    /// One JSON object per line
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    pub format: LogFormat,

    /// Log file path (None = stderr)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            success_threshold: 2,
            call_timeout_ms: 30_000,
        }
    }
}

impl From<&CircuitBreakerSection> for CircuitBreakerConfig {
    fn from(section: &CircuitBreakerSection) -> Self {
        CircuitBreakerConfig {
            failure_threshold: section.failure_threshold,
            recovery_timeout: millis(section.recovery_timeout_ms),
            success_threshold: section.success_threshold,
            call_timeout: millis(section.call_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSection {
    /// Tokens added per second
    pub rate: f64,
    pub capacity: f64,
    pub cost_per_request: f64,
}

impl Default for RateLimiterSection {
    fn default() -> Self {
        Self {
            rate: 10.0,
            capacity: 10.0,
            cost_per_request: 1.0,
        }
    }
}

impl From<&RateLimiterSection> for RateLimiterConfig {
    fn from(section: &RateLimiterSection) -> Self {
        RateLimiterConfig {
            rate: section.rate,
            capacity: section.capacity,
            cost_per_request: section.cost_per_request,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_size: usize,
    pub ttl_ms: u64,
    /// Sweep expired entries every this many requests
    pub sweep_interval: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl_ms: 300_000,
            sweep_interval: 100,
        }
    }
}

impl From<&CacheSection> for CacheConfig {
    fn from(section: &CacheSection) -> Self {
        CacheConfig {
            max_size: section.max_size,
            default_ttl: millis(section.ttl_ms),
            sweep_interval: section.sweep_interval,
            key_fn: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingSection {
    pub max_batch_size: usize,
    pub max_wait_ms: u64,
    pub max_queue_size: usize,
}

impl Default for BatchingSection {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait_ms: 100,
            max_queue_size: 1000,
        }
    }
}

impl From<&BatchingSection> for BatchConfig {
    fn from(section: &BatchingSection) -> Self {
        BatchConfig {
            max_batch_size: section.max_batch_size,
            max_wait_time: millis(section.max_wait_ms),
            max_queue_size: section.max_queue_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Only retry errors classified as transient
    pub transient_only: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            transient_only: false,
        }
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        let config = RetryConfig {
            max_attempts: section.max_attempts,
            initial_backoff: millis(section.initial_backoff_ms),
            max_backoff: millis(section.max_backoff_ms),
            multiplier: section.multiplier,
            retryable: None,
        };
        if section.transient_only {
            config.with_predicate(ProcessorError::is_transient)
        } else {
            config
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub timeout_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl From<&TimeoutSection> for TimeoutConfig {
    fn from(section: &TimeoutSection) -> Self {
        TimeoutConfig::new(millis(section.timeout_ms))
    }
}
