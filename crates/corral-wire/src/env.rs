//! Environment contract between the host and a supervised daemon.
//!
//! The host injects these variables when launching a daemon; the daemon reads
//! them back with [`DaemonEnvironment::from_env`] to find its channels.

use corral_config::{Endpoint, EndpointParseError, LogLevel, LogLevelParseError};
use thiserror::Error;

use crate::client::{EventPublisher, LogForwarder};
use crate::frame::FrameError;

/// Identifier the daemon must stamp on its frames.
pub const DAEMON_ID: &str = "CORRAL_DAEMON_ID";
/// Event channel endpoint the daemon publishes to.
pub const EVENT_ENDPOINT: &str = "CORRAL_EVENT_ENDPOINT";
/// Log server endpoint the daemon forwards records to.
pub const LOG_ENDPOINT: &str = "CORRAL_LOG_ENDPOINT";
/// Minimum level the daemon forwards.
pub const LOG_LEVEL: &str = "CORRAL_LOG_LEVEL";
/// Optional prefix for forwarded messages.
pub const LOG_PREFIX: &str = "CORRAL_LOG_PREFIX";

/// Channel wiring handed to a daemon at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonEnvironment {
    /// Identifier assigned by the host.
    pub daemon_id: String,
    /// Where to publish events, when the daemon takes part in the event channel.
    pub event_endpoint: Option<Endpoint>,
    /// Where to forward logs, when the daemon takes part in the log channel.
    pub log_endpoint: Option<Endpoint>,
    /// Minimum level to forward.
    pub log_level: LogLevel,
    /// Optional message prefix.
    pub log_prefix: Option<String>,
}

impl DaemonEnvironment {
    /// Builds an environment with no channels attached.
    #[must_use]
    pub fn new(daemon_id: impl Into<String>) -> Self {
        Self {
            daemon_id: daemon_id.into(),
            event_endpoint: None,
            log_endpoint: None,
            log_level: LogLevel::default(),
            log_prefix: None,
        }
    }

    /// Reads the contract from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError`] when the daemon id is missing or a value fails to
    /// parse.
    pub fn from_env() -> Result<Self, EnvError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the contract through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError`] when the daemon id is missing or a value fails to
    /// parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EnvError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let daemon_id = read(DAEMON_ID).ok_or(EnvError::MissingDaemonId)?;
        let endpoint = |key: &'static str| {
            read(key)
                .map(|value| {
                    value
                        .parse::<Endpoint>()
                        .map_err(|source| EnvError::Endpoint { key, value, source })
                })
                .transpose()
        };
        let event_endpoint = endpoint(EVENT_ENDPOINT)?;
        let log_endpoint = endpoint(LOG_ENDPOINT)?;
        let log_level = read(LOG_LEVEL)
            .map(|value| {
                value
                    .parse::<LogLevel>()
                    .map_err(|source| EnvError::Level { value, source })
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            daemon_id,
            event_endpoint,
            log_endpoint,
            log_level,
            log_prefix: read(LOG_PREFIX),
        })
    }

    /// Renders the contract as environment variable pairs.
    #[must_use]
    pub fn to_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (DAEMON_ID, self.daemon_id.clone()),
            (LOG_LEVEL, self.log_level.to_string()),
        ];
        if let Some(endpoint) = &self.event_endpoint {
            vars.push((EVENT_ENDPOINT, endpoint.to_string()));
        }
        if let Some(endpoint) = &self.log_endpoint {
            vars.push((LOG_ENDPOINT, endpoint.to_string()));
        }
        if let Some(prefix) = &self.log_prefix {
            vars.push((LOG_PREFIX, prefix.clone()));
        }
        vars
    }

    /// Connects an [`EventPublisher`] when an event endpoint is configured.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection fails.
    pub fn connect_events(&self) -> Result<Option<EventPublisher>, FrameError> {
        self.event_endpoint
            .as_ref()
            .map(|endpoint| EventPublisher::connect(endpoint, self.daemon_id.as_str()))
            .transpose()
    }

    /// Connects a [`LogForwarder`] when a log endpoint is configured.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection fails.
    pub fn connect_logs(&self) -> Result<Option<LogForwarder>, FrameError> {
        self.log_endpoint
            .as_ref()
            .map(|endpoint| {
                LogForwarder::connect(endpoint, self.daemon_id.as_str(), self.log_level)
                    .map(|forwarder| forwarder.with_prefix(self.log_prefix.clone()))
            })
            .transpose()
    }
}

/// Errors raised while reading a [`DaemonEnvironment`].
#[derive(Debug, Error)]
pub enum EnvError {
    /// The daemon id variable was unset.
    #[error("CORRAL_DAEMON_ID is not set")]
    MissingDaemonId,
    /// An endpoint variable failed to parse.
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
    /// The level variable failed to parse.
    #[error("CORRAL_LOG_LEVEL: unknown level '{value}': {source}")]
    Level {
        /// Raw value that was rejected.
        value: String,
        /// Underlying error.
        #[source]
        source: LogLevelParseError,
    },
}
