//! Default values applied when no override is configured.

use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::logging::{LogFormat, LogLevel};

/// Default log filter expression for the host process.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Overall budget for a spawn to reach readiness.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time a daemon is given to exit after the graceful termination signal.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How long received events stay queryable for retroactive matching.
pub const DEFAULT_EVENT_RETENTION: Duration = Duration::from_secs(300);

/// Number of spawn attempts before giving up.
pub const DEFAULT_MAX_START_ATTEMPTS: u32 = 1;

/// Number of trailing stdout/stderr lines retained per daemon.
pub const DEFAULT_OUTPUT_CAPTURE_LINES: usize = 5_000;

/// Default log filter expression for the host process.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Default output format for the host process.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

/// Minimum level daemons forward to the log server.
#[must_use]
pub const fn default_forward_level() -> LogLevel {
    LogLevel::Info
}

/// Event channel endpoint: loopback with an ephemeral port.
#[must_use]
pub fn default_event_endpoint() -> Endpoint {
    Endpoint::loopback(0)
}

/// Log channel endpoint: loopback with an ephemeral port.
#[must_use]
pub fn default_log_endpoint() -> Endpoint {
    Endpoint::loopback(0)
}
