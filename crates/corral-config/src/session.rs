//! Session-wide configuration and its environment overlay.

use std::num::ParseIntError;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults;
use crate::endpoint::{Endpoint, EndpointParseError};
use crate::logging::{LogFormat, LogFormatParseError, LogLevel, LogLevelParseError};

/// Environment variables read by [`SessionConfig::from_env`].
pub mod env_keys {
    /// Host log filter expression.
    pub const LOG_FILTER: &str = "CORRAL_LOG_FILTER";
    /// Host log output format (`json` or `compact`).
    pub const LOG_FORMAT: &str = "CORRAL_LOG_FORMAT";
    /// Event channel endpoint URL.
    pub const EVENT_ENDPOINT: &str = "CORRAL_EVENT_ENDPOINT";
    /// Log channel endpoint URL.
    pub const LOG_ENDPOINT: &str = "CORRAL_LOG_ENDPOINT";
    /// Minimum level daemons forward.
    pub const FORWARD_LEVEL: &str = "CORRAL_FORWARD_LEVEL";
    /// Spawn readiness budget in milliseconds.
    pub const START_TIMEOUT_MS: &str = "CORRAL_START_TIMEOUT_MS";
    /// Readiness poll interval in milliseconds.
    pub const POLL_INTERVAL_MS: &str = "CORRAL_POLL_INTERVAL_MS";
    /// Graceful stop window in milliseconds.
    pub const STOP_GRACE_MS: &str = "CORRAL_STOP_GRACE_MS";
    /// Number of spawn attempts.
    pub const MAX_START_ATTEMPTS: &str = "CORRAL_MAX_START_ATTEMPTS";
    /// Event history retention in milliseconds.
    pub const EVENT_RETENTION_MS: &str = "CORRAL_EVENT_RETENTION_MS";
}

/// Configuration shared by every daemon spawned within one test session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    log_filter: String,
    log_format: LogFormat,
    forward_level: LogLevel,
    event_endpoint: Endpoint,
    log_endpoint: Endpoint,
    start_timeout: Duration,
    poll_interval: Duration,
    stop_grace_period: Duration,
    max_start_attempts: u32,
    event_retention: Duration,
    output_capture_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_filter: defaults::default_log_filter().to_owned(),
            log_format: defaults::default_log_format(),
            forward_level: defaults::default_forward_level(),
            event_endpoint: defaults::default_event_endpoint(),
            log_endpoint: defaults::default_log_endpoint(),
            start_timeout: defaults::DEFAULT_START_TIMEOUT,
            poll_interval: defaults::DEFAULT_POLL_INTERVAL,
            stop_grace_period: defaults::DEFAULT_STOP_GRACE_PERIOD,
            max_start_attempts: defaults::DEFAULT_MAX_START_ATTEMPTS,
            event_retention: defaults::DEFAULT_EVENT_RETENTION,
            output_capture_lines: defaults::DEFAULT_OUTPUT_CAPTURE_LINES,
        }
    }
}

impl SessionConfig {
    /// Loads defaults overlaid with `CORRAL_*` process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first variable whose value fails to
    /// parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads defaults overlaid with values produced by `lookup`.
    ///
    /// Empty values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first variable whose value fails to
    /// parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(filter) = read(env_keys::LOG_FILTER) {
            config.log_filter = filter;
        }
        if let Some(value) = read(env_keys::LOG_FORMAT) {
            config.log_format = value.parse().map_err(|source: LogFormatParseError| {
                ConfigError::LogFormat {
                    key: env_keys::LOG_FORMAT,
                    value,
                    source,
                }
            })?;
        }
        if let Some(value) = read(env_keys::FORWARD_LEVEL) {
            config.forward_level = value.parse().map_err(|source: LogLevelParseError| {
                ConfigError::LogLevel {
                    key: env_keys::FORWARD_LEVEL,
                    value,
                    source,
                }
            })?;
        }
        if let Some(value) = read(env_keys::EVENT_ENDPOINT) {
            config.event_endpoint = parse_endpoint(env_keys::EVENT_ENDPOINT, value)?;
        }
        if let Some(value) = read(env_keys::LOG_ENDPOINT) {
            config.log_endpoint = parse_endpoint(env_keys::LOG_ENDPOINT, value)?;
        }
        if let Some(value) = read(env_keys::START_TIMEOUT_MS) {
            config.start_timeout = parse_millis(env_keys::START_TIMEOUT_MS, value)?;
        }
        if let Some(value) = read(env_keys::POLL_INTERVAL_MS) {
            config.poll_interval = parse_millis(env_keys::POLL_INTERVAL_MS, value)?;
        }
        if let Some(value) = read(env_keys::STOP_GRACE_MS) {
            config.stop_grace_period = parse_millis(env_keys::STOP_GRACE_MS, value)?;
        }
        if let Some(value) = read(env_keys::EVENT_RETENTION_MS) {
            config.event_retention = parse_millis(env_keys::EVENT_RETENTION_MS, value)?;
        }
        if let Some(value) = read(env_keys::MAX_START_ATTEMPTS) {
            config.max_start_attempts = parse_attempts(value)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                key: env_keys::POLL_INTERVAL_MS,
            });
        }
        if self.start_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                key: env_keys::START_TIMEOUT_MS,
            });
        }
        Ok(())
    }

    /// Host log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Host log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Minimum level daemons forward to the log server.
    #[must_use]
    pub const fn forward_level(&self) -> LogLevel {
        self.forward_level
    }

    /// Endpoint the event listener binds.
    #[must_use]
    pub const fn event_endpoint(&self) -> &Endpoint {
        &self.event_endpoint
    }

    /// Endpoint the log server binds.
    #[must_use]
    pub const fn log_endpoint(&self) -> &Endpoint {
        &self.log_endpoint
    }

    /// Budget for a spawn to reach readiness.
    #[must_use]
    pub const fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    /// Interval between readiness polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Graceful stop window applied when none is given explicitly.
    #[must_use]
    pub const fn stop_grace_period(&self) -> Duration {
        self.stop_grace_period
    }

    /// Number of spawn attempts applied when a spec does not override it.
    #[must_use]
    pub const fn max_start_attempts(&self) -> u32 {
        self.max_start_attempts
    }

    /// Retention window for the event history.
    #[must_use]
    pub const fn event_retention(&self) -> Duration {
        self.event_retention
    }

    /// Trailing output lines retained per daemon.
    #[must_use]
    pub const fn output_capture_lines(&self) -> usize {
        self.output_capture_lines
    }

    /// Replaces the host log filter.
    #[must_use]
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Replaces the forwarding threshold.
    #[must_use]
    pub const fn with_forward_level(mut self, level: LogLevel) -> Self {
        self.forward_level = level;
        self
    }

    /// Replaces the event listener endpoint.
    #[must_use]
    pub fn with_event_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.event_endpoint = endpoint;
        self
    }

    /// Replaces the log server endpoint.
    #[must_use]
    pub fn with_log_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.log_endpoint = endpoint;
        self
    }

    /// Replaces the default spawn budget.
    #[must_use]
    pub const fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Replaces the readiness poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replaces the default stop grace period.
    #[must_use]
    pub const fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Replaces the default number of spawn attempts. Zero is raised to one.
    #[must_use]
    pub fn with_max_start_attempts(mut self, attempts: u32) -> Self {
        self.max_start_attempts = attempts.max(1);
        self
    }

    /// Replaces the event retention window.
    #[must_use]
    pub const fn with_event_retention(mut self, retention: Duration) -> Self {
        self.event_retention = retention;
        self
    }

    /// Replaces the per-daemon output capture size.
    #[must_use]
    pub const fn with_output_capture_lines(mut self, lines: usize) -> Self {
        self.output_capture_lines = lines;
        self
    }
}

fn parse_endpoint(key: &'static str, value: String) -> Result<Endpoint, ConfigError> {
    value
        .parse()
        .map_err(|source| ConfigError::Endpoint { key, value, source })
}

fn parse_millis(key: &'static str, value: String) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|source| ConfigError::Number { key, value, source })
}

fn parse_attempts(value: String) -> Result<u32, ConfigError> {
    let key = env_keys::MAX_START_ATTEMPTS;
    let attempts = value
        .trim()
        .parse::<u32>()
        .map_err(|source| ConfigError::Number {
            key,
            value: value.clone(),
            source,
        })?;
    if attempts == 0 {
        return Err(ConfigError::ZeroAttempts { key });
    }
    Ok(attempts)
}

/// Errors raised while loading a [`SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An endpoint URL failed to parse.
    #[error("{key}: invalid endpoint '{value}': {source}")]
    Endpoint {
        /// Variable or setting that was rejected.
        key: &'static str,
        /// Raw value that was rejected.
        value: String,
        /// Underlying error.
        #[source]
        source: EndpointParseError,
    },
    /// A log format name was not recognised.
    #[error("{key}: unknown log format '{value}': {source}")]
    LogFormat {
        /// Variable or setting that was rejected.
        key: &'static str,
        /// Raw value that was rejected.
        value: String,
        /// Underlying error.
        #[source]
        source: LogFormatParseError,
    },
    /// A log level name was not recognised.
    #[error("{key}: unknown log level '{value}': {source}")]
    LogLevel {
        /// Variable or setting that was rejected.
        key: &'static str,
        /// Raw value that was rejected.
        value: String,
        /// Underlying error.
        #[source]
        source: LogLevelParseError,
    },
    /// A numeric value failed to parse.
    #[error("{key}: invalid number '{value}': {source}")]
    Number {
        /// Variable or setting that was rejected.
        key: &'static str,
        /// Raw value that was rejected.
        value: String,
        /// Underlying error.
        #[source]
        source: ParseIntError,
    },
    /// A duration that must be positive was zero.
    #[error("{key}: duration must be greater than zero")]
    ZeroDuration {
        /// Variable or setting that was rejected.
        key: &'static str,
    },
    /// The attempt count was zero.
    #[error("{key}: at least one start attempt is required")]
    ZeroAttempts {
        /// Variable or setting that was rejected.
        key: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let config = SessionConfig::from_lookup(|_| None).expect("defaults load");
        assert_eq!(config, SessionConfig::default());
        assert!(config.event_endpoint().is_ephemeral());
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.max_start_attempts(), 1);
    }

    #[test]
    fn environment_overrides_defaults() {
        let lookup = lookup_from(&[
            (env_keys::LOG_FILTER, "corral=debug"),
            (env_keys::LOG_FORMAT, "json"),
            (env_keys::FORWARD_LEVEL, "debug"),
            (env_keys::EVENT_ENDPOINT, "tcp://127.0.0.1:4506"),
            (env_keys::START_TIMEOUT_MS, "2500"),
            (env_keys::POLL_INTERVAL_MS, "25"),
            (env_keys::STOP_GRACE_MS, "750"),
            (env_keys::MAX_START_ATTEMPTS, "3"),
        ]);
        let config = SessionConfig::from_lookup(lookup).expect("config loads");

        assert_eq!(config.log_filter(), "corral=debug");
        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.forward_level(), LogLevel::Debug);
        assert_eq!(config.event_endpoint(), &Endpoint::loopback(4506));
        assert_eq!(config.start_timeout(), Duration::from_millis(2500));
        assert_eq!(config.poll_interval(), Duration::from_millis(25));
        assert_eq!(config.stop_grace_period(), Duration::from_millis(750));
        assert_eq!(config.max_start_attempts(), 3);
    }

    #[test]
    fn blank_values_are_ignored() {
        let lookup = lookup_from(&[(env_keys::LOG_FILTER, "  ")]);
        let config = SessionConfig::from_lookup(lookup).expect("config loads");
        assert_eq!(config.log_filter(), defaults::DEFAULT_LOG_FILTER);
    }

    #[rstest]
    #[case(env_keys::START_TIMEOUT_MS, "soon")]
    #[case(env_keys::LOG_FORMAT, "xml")]
    #[case(env_keys::FORWARD_LEVEL, "loud")]
    #[case(env_keys::LOG_ENDPOINT, "ftp://host:1")]
    #[case(env_keys::MAX_START_ATTEMPTS, "0")]
    #[case(env_keys::POLL_INTERVAL_MS, "0")]
    fn invalid_values_name_their_variable(#[case] key: &str, #[case] value: &str) {
        let pairs = [(key, value)];
        let lookup = lookup_from(&pairs);
        let error = SessionConfig::from_lookup(lookup).expect_err("config should fail");
        assert!(
            error.to_string().starts_with(key),
            "error should name {key}: {error}"
        );
    }

    #[test]
    fn builder_clamps_attempts() {
        let config = SessionConfig::default().with_max_start_attempts(0);
        assert_eq!(config.max_start_attempts(), 1);
    }
}
