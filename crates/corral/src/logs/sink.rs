//! Destinations for forwarded daemon logs.

use std::sync::{Arc, Mutex, PoisonError};

use corral_config::LogLevel;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::LogRecord;

const DAEMON_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::daemon");

/// Receives records from the log server.
///
/// Called from connection threads; records from one daemon arrive in order.
pub trait LogSink: Send + Sync {
    /// Accepts one record.
    fn emit(&self, record: &LogRecord);
}

impl<T> LogSink for Arc<T>
where
    T: LogSink + ?Sized,
{
    fn emit(&self, record: &LogRecord) {
        (**self).emit(record);
    }
}

/// Re-emits daemon records as `tracing` events in the host process.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TracingSink {
    /// Builds a new sink.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl LogSink for TracingSink {
    fn emit(&self, record: &LogRecord) {
        let emitted_at = OffsetDateTime::from(record.timestamp)
            .format(&Rfc3339)
            .unwrap_or_default();
        let daemon_id = record.daemon_id.as_str();
        let logger = record.logger.as_str();
        let message = record.message.as_str();
        match record.level {
            LogLevel::Trace => {
                tracing::trace!(
                    target: DAEMON_TARGET,
                    daemon_id,
                    logger,
                    emitted_at = %emitted_at,
                    "{message}"
                );
            }
            LogLevel::Debug => {
                tracing::debug!(
                    target: DAEMON_TARGET,
                    daemon_id,
                    logger,
                    emitted_at = %emitted_at,
                    "{message}"
                );
            }
            LogLevel::Info => {
                tracing::info!(
                    target: DAEMON_TARGET,
                    daemon_id,
                    logger,
                    emitted_at = %emitted_at,
                    "{message}"
                );
            }
            LogLevel::Warn => {
                tracing::warn!(
                    target: DAEMON_TARGET,
                    daemon_id,
                    logger,
                    emitted_at = %emitted_at,
                    "{message}"
                );
            }
            LogLevel::Error => {
                tracing::error!(
                    target: DAEMON_TARGET,
                    daemon_id,
                    logger,
                    emitted_at = %emitted_at,
                    "{message}"
                );
            }
        }
    }
}

/// Keeps every record in memory, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<Vec<LogRecord>>,
}

impl CollectingSink {
    /// Builds an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record received so far, in arrival order.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records forwarded by `daemon_id`, in arrival order.
    #[must_use]
    pub fn records_for(&self, daemon_id: &str) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|record| record.daemon_id == daemon_id)
            .cloned()
            .collect()
    }
}

impl LogSink for CollectingSink {
    fn emit(&self, record: &LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}
