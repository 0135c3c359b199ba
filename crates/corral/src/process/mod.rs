//! Supervision of one daemon process: launch, lifecycle state, captured
//! output, and graceful-then-forced termination.

use std::time::Duration;

mod command;
mod output;
mod signal;
mod state;
mod supervisor;

pub use state::{InvalidTransition, ProcessState};
pub use supervisor::{ProcessResult, Supervisor};
pub(crate) use supervisor::{ChannelDetach, Wiring};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");
pub(crate) const OUTPUT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::output");

/// Longest wait for exit after the forced kill.
pub(crate) const KILL_WAIT: Duration = Duration::from_secs(5);
/// Interval between exit checks while waiting on a signalled process.
pub(crate) const EXIT_POLL: Duration = Duration::from_millis(20);
/// Longest wait for the output readers once the process has exited.
pub(crate) const DRAIN_JOIN: Duration = Duration::from_secs(2);
