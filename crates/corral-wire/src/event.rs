//! Event channel frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tagged event as published by a daemon.
///
/// The payload is carried verbatim; the host never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Identifier of the publishing daemon.
    pub daemon_id: String,
    /// Hierarchical tag, segments separated by `/`.
    pub tag: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
}

impl EventFrame {
    /// Builds a frame for `daemon_id`.
    #[must_use]
    pub fn new(daemon_id: impl Into<String>, tag: impl Into<String>, data: Value) -> Self {
        Self {
            daemon_id: daemon_id.into(),
            tag: tag.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;
    use serde_json::json;

    #[test]
    fn payload_defaults_to_null() {
        let frame: EventFrame =
            decode(br#"{"daemon_id":"master-1","tag":"job/1/started"}"#).expect("decode");
        assert_eq!(frame.data, Value::Null);
    }

    #[test]
    fn payload_is_preserved_verbatim() {
        let frame: EventFrame = decode(
            br#"{"daemon_id":"minion-1","tag":"job/7/complete","data":{"ret":[1,2],"ok":true}}"#,
        )
        .expect("decode");
        assert_eq!(frame.data, json!({"ret": [1, 2], "ok": true}));
    }
}
