//! Log channel frames.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{LogLevel, unix_millis};

/// One structured log record forwarded by a daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFrame {
    /// Identifier of the forwarding daemon.
    pub daemon_id: String,
    /// Record severity.
    pub level: LogLevel,
    /// Name of the emitting logger or tracing target.
    #[serde(default)]
    pub logger: String,
    /// Rendered message.
    pub message: String,
    /// Emission time in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl LogFrame {
    /// Builds a record stamped with the current time.
    #[must_use]
    pub fn now(
        daemon_id: impl Into<String>,
        level: LogLevel,
        logger: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            daemon_id: daemon_id.into(),
            level,
            logger: logger.into(),
            message: message.into(),
            timestamp_ms: unix_millis(SystemTime::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;

    #[test]
    fn decodes_minimal_record() {
        let frame: LogFrame =
            decode(br#"{"daemon_id":"d1","level":"warning","message":"disk low"}"#)
                .expect("decode");
        assert_eq!(frame.level, LogLevel::Warn);
        assert!(frame.logger.is_empty());
        assert_eq!(frame.timestamp_ms, 0);
    }

    #[test]
    fn unknown_levels_are_rejected() {
        assert!(decode::<LogFrame>(br#"{"daemon_id":"d1","level":"loud","message":"x"}"#).is_err());
    }
}
