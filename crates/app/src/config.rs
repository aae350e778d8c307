//! Environment-driven runtime configuration.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use forgeflow_observability::LogFormat;
use forgeflow_queue::{QueueConfig, TaskOptions, WorkerConfig};
use forgeflow_resilience::{Backoff, CircuitBreakerConfig};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings, read from `FORGEFLOW_*` variables and `REDIS_URL`.
///
/// Durations are given in milliseconds. Unset variables keep their default.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Workers per queue (`FORGEFLOW_WORKERS`)
    pub worker_concurrency: usize,
    /// Broker receive timeout per poll (`FORGEFLOW_POLL_INTERVAL_MS`)
    pub poll_interval: Duration,
    /// `FORGEFLOW_VISIBILITY_TIMEOUT_MS`
    pub visibility_timeout: Duration,
    /// `FORGEFLOW_HANDLER_TIMEOUT_MS`
    pub handler_timeout: Duration,
    /// Deliveries per task before dead-lettering (`FORGEFLOW_MAX_ATTEMPTS`)
    pub max_attempts: u32,
    /// `FORGEFLOW_BACKOFF_BASE_MS`
    pub backoff_base: Duration,
    /// `FORGEFLOW_BACKOFF_MAX_MS`
    pub backoff_max: Duration,
    /// `FORGEFLOW_BREAKER_THRESHOLD`
    pub breaker_threshold: u32,
    /// `FORGEFLOW_BREAKER_COOLDOWN_MS`
    pub breaker_cooldown: Duration,
    /// `FORGEFLOW_LOG_FORMAT` (`json` or `pretty`)
    pub log_format: LogFormat,
    /// `REDIS_URL`; the in-memory broker is used when unset
    pub redis_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            poll_interval: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(30),
            max_attempts: 5,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            log_format: LogFormat::Json,
            redis_url: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let worker_concurrency = parse_or(&get, "FORGEFLOW_WORKERS", defaults.worker_concurrency)?;
        if worker_concurrency == 0 {
            return Err(invalid("FORGEFLOW_WORKERS", "0", "must be at least 1"));
        }
        let max_attempts = parse_or(&get, "FORGEFLOW_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid("FORGEFLOW_MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        let log_format = match get("FORGEFLOW_LOG_FORMAT") {
            Some(raw) => LogFormat::parse(&raw)
                .ok_or_else(|| invalid("FORGEFLOW_LOG_FORMAT", &raw, "expected 'json' or 'pretty'"))?,
            None => defaults.log_format,
        };

        let config = Self {
            worker_concurrency,
            poll_interval: millis_or(&get, "FORGEFLOW_POLL_INTERVAL_MS", defaults.poll_interval)?,
            visibility_timeout: millis_or(
                &get,
                "FORGEFLOW_VISIBILITY_TIMEOUT_MS",
                defaults.visibility_timeout,
            )?,
            handler_timeout: millis_or(&get, "FORGEFLOW_HANDLER_TIMEOUT_MS", defaults.handler_timeout)?,
            max_attempts,
            backoff_base: millis_or(&get, "FORGEFLOW_BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_max: millis_or(&get, "FORGEFLOW_BACKOFF_MAX_MS", defaults.backoff_max)?,
            breaker_threshold: parse_or(&get, "FORGEFLOW_BREAKER_THRESHOLD", defaults.breaker_threshold)?,
            breaker_cooldown: millis_or(&get, "FORGEFLOW_BREAKER_COOLDOWN_MS", defaults.breaker_cooldown)?,
            log_format,
            redis_url: get("REDIS_URL"),
        };

        if config.backoff_max < config.backoff_base {
            return Err(invalid(
                "FORGEFLOW_BACKOFF_MAX_MS",
                &config.backoff_max.as_millis().to_string(),
                "must not be below FORGEFLOW_BACKOFF_BASE_MS",
            ));
        }

        Ok(config)
    }

    pub fn task_options(&self) -> TaskOptions {
        TaskOptions::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(Backoff::exponential(self.backoff_base, self.backoff_max))
            .with_visibility_timeout(self.visibility_timeout)
            .with_handler_timeout(self.handler_timeout)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_default_options(self.task_options())
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(self.breaker_threshold)
                    .with_cooldown(self.breaker_cooldown),
            )
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default().with_poll_interval(self.poll_interval)
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&'static str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&'static str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(get, key, default_ms).map(Duration::from_millis)
}
