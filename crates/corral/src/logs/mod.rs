//! Central log server for daemon log records.
//!
//! The server binds before any daemon starts so each daemon can be told where
//! to forward at launch. Every connection is served on its own thread and its
//! records reach the [`LogSink`] in the order they were read, so ordering
//! holds per daemon but not across daemons.

mod server;
mod sink;

use std::time::SystemTime;

use corral_config::LogLevel;

pub use self::server::LogServer;
pub use self::sink::{CollectingSink, LogSink, TracingSink};

const LOGS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::logs");

/// A log record received from a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Daemon that forwarded the record.
    pub daemon_id: String,
    /// Severity.
    pub level: LogLevel,
    /// Logger or tracing target inside the daemon.
    pub logger: String,
    /// Rendered message.
    pub message: String,
    /// When the daemon emitted the record, or when it was received if the
    /// daemon did not say.
    pub timestamp: SystemTime,
}
