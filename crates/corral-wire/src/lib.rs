//! Wire contracts shared by the corral host and the daemons it supervises.
//!
//! Both the event channel and the log channel carry newline-delimited JSON
//! documents. This crate defines the frame types, the bounded frame reader
//! used by the host listeners, and the daemon-side clients that publish
//! events and forward log records.

mod client;
pub mod env;
mod event;
mod frame;
mod layer;
mod log;

pub use corral_config::LogLevel;

pub use self::client::{EventPublisher, LogForwarder};
pub use self::env::{DaemonEnvironment, EnvError};
pub use self::event::EventFrame;
pub use self::frame::{FrameError, FrameReader, MAX_FRAME_BYTES, ReadOutcome, decode, write_frame};
pub use self::layer::{ForwardingLayer, level_from_tracing};
pub use self::log::LogFrame;

/// Milliseconds since the Unix epoch, saturating on clock anomalies.
#[must_use]
pub fn unix_millis(at: std::time::SystemTime) -> u64 {
    at.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}
