//! Session-wide event listener.
//!
//! Daemons publish tagged frames to one endpoint shared by the session. A
//! single dispatcher thread stamps each decoded frame with a sequence number,
//! keeps it in a bounded history, and broadcasts it to every subscription
//! whose pattern matches.

mod listener;
mod pattern;
mod subscription;

use std::time::SystemTime;

use serde_json::Value;

pub use self::listener::EventListener;
pub(crate) use self::listener::wait_on;
pub use self::pattern::TagPattern;
pub use self::subscription::Subscription;

const EVENTS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::events");

/// An event as received by the listener. Immutable once received.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Daemon that published the event.
    pub daemon_id: String,
    /// Hierarchical tag.
    pub tag: String,
    /// Opaque payload.
    pub data: Value,
    /// When the listener read the frame.
    pub received_at: SystemTime,
    /// Position in the session-wide arrival order, starting at 1.
    pub sequence: u64,
}
