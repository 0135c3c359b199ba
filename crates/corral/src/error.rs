//! Error kinds surfaced to callers.
//!
//! Each error carries the daemon id and enough state to diagnose a failure
//! without digging through logs.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessState;
use crate::spec::SpecError;
use crate::transport::ListenerError;

/// The executable could not be launched.
#[derive(Debug, Error)]
#[error("daemon '{daemon_id}' failed to launch '{program}': {reason}")]
pub struct ProcessStartError {
    /// Daemon identifier.
    pub daemon_id: String,
    /// Program that was executed.
    pub program: String,
    /// Why the launch failed.
    #[source]
    pub reason: StartFailure,
}

/// Cause of a [`ProcessStartError`].
#[derive(Debug, Error)]
pub enum StartFailure {
    /// The executable does not exist.
    #[error("executable not found")]
    NotFound(#[source] io::Error),
    /// The executable exists but may not be run.
    #[error("permission denied")]
    PermissionDenied(#[source] io::Error),
    /// Any other launch failure.
    #[error("spawn failed: {0}")]
    Spawn(#[source] io::Error),
    /// The process was already started once.
    #[error("process is already {0}")]
    AlreadyStarted(ProcessState),
}

impl StartFailure {
    pub(crate) fn from_io(source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(source),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(source),
            _ => Self::Spawn(source),
        }
    }
}

/// A daemon never satisfied all of its readiness checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessTimeoutError {
    /// Daemon identifier.
    pub daemon_id: String,
    /// OS process id of the attempt that timed out.
    pub pid: Option<u32>,
    /// Budget that expired.
    pub timeout: Duration,
    /// Names of checks that never succeeded.
    pub pending: Vec<String>,
    /// Last observation recorded for each pending check.
    pub observations: Vec<(String, String)>,
    /// Process state when the budget expired.
    pub last_state: ProcessState,
    /// Number of start attempts made.
    pub attempts: u32,
}

impl fmt::Display for ReadinessTimeoutError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "daemon '{}' not ready after {:?} (state {}, attempts {}); pending checks: {}",
            self.daemon_id,
            self.timeout,
            self.last_state,
            self.attempts,
            self.pending.join(", ")
        )?;
        for (check, observation) in &self.observations {
            write!(formatter, "; {check}: {observation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ReadinessTimeoutError {}

/// An awaited event pattern never matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTimeoutError {
    /// Pattern that was awaited.
    pub pattern: String,
    /// Origin filter, when the wait was scoped to one daemon.
    pub daemon_id: Option<String>,
    /// Budget that expired.
    pub timeout: Duration,
    /// Whether the wait ended early because the listener shut down.
    pub listener_closed: bool,
}

impl fmt::Display for EventTimeoutError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "no event matching '{}'", self.pattern)?;
        if let Some(daemon_id) = &self.daemon_id {
            write!(formatter, " from '{daemon_id}'")?;
        }
        write!(formatter, " within {:?}", self.timeout)?;
        if self.listener_closed {
            formatter.write_str(" (event listener closed)")?;
        }
        Ok(())
    }
}

impl std::error::Error for EventTimeoutError {}

/// Both graceful and forced termination failed.
#[derive(Debug, Error)]
#[error("failed to terminate daemon '{daemon_id}' (pid {pid}): {reason}")]
pub struct TerminationError {
    /// Daemon identifier.
    pub daemon_id: String,
    /// OS process id.
    pub pid: u32,
    /// What went wrong.
    #[source]
    pub reason: TerminationFailure,
}

/// Cause of a [`TerminationError`].
#[derive(Debug, Error)]
pub enum TerminationFailure {
    /// Delivering a signal failed for a reason other than the process being gone.
    #[error("sending {signal} failed: {source}")]
    Signal {
        /// Signal that was being delivered.
        signal: &'static str,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The process survived the forced kill.
    #[error("process still running {waited:?} after forced kill")]
    DidNotExit {
        /// How long the supervisor waited.
        waited: Duration,
    },
    /// Reaping the process failed.
    #[error("waiting for exit failed: {0}")]
    Wait(#[source] io::Error),
}

/// Everything [`crate::Factory::spawn`] can fail with.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The spec failed validation.
    #[error(transparent)]
    InvalidSpec(#[from] SpecError),
    /// The executable could not be launched. Never retried.
    #[error(transparent)]
    Start(#[from] ProcessStartError),
    /// The daemon never became ready.
    #[error(transparent)]
    Readiness(#[from] ReadinessTimeoutError),
    /// The daemon exited before it became ready.
    #[error(
        "daemon '{daemon_id}' exited during start with {status} after {attempts} attempt(s){}",
        last_line(.stderr_tail)
    )]
    Exited {
        /// Daemon identifier.
        daemon_id: String,
        /// How the process ended.
        status: ExitSummary,
        /// Number of start attempts made.
        attempts: u32,
        /// Last lines the daemon wrote to stderr.
        stderr_tail: Vec<String>,
    },
    /// Another live daemon already uses this id.
    #[error("daemon id '{0}' is already registered in this session")]
    DuplicateId(String),
    /// The session has been torn down.
    #[error("session is closed; cannot spawn '{0}'")]
    SessionClosed(String),
}

impl SpawnError {
    /// Daemon id the failure concerns, when known.
    #[must_use]
    pub fn daemon_id(&self) -> Option<&str> {
        match self {
            Self::InvalidSpec(_) => None,
            Self::Start(error) => Some(&error.daemon_id),
            Self::Readiness(error) => Some(&error.daemon_id),
            Self::Exited { daemon_id, .. }
            | Self::DuplicateId(daemon_id)
            | Self::SessionClosed(daemon_id) => Some(daemon_id),
        }
    }
}

fn last_line(lines: &[String]) -> String {
    lines
        .last()
        .map(|line| format!("; stderr: {line}"))
        .unwrap_or_default()
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSummary {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when the process was killed.
    pub signal: Option<i32>,
}

impl fmt::Display for ExitSummary {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(formatter, "exit code {code}"),
            (None, Some(signal)) => write!(formatter, "signal {signal}"),
            (None, None) => formatter.write_str("unknown status"),
        }
    }
}

/// Errors raised while starting a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The event listener could not bind.
    #[error("failed to start event listener: {0}")]
    EventListener(#[source] ListenerError),
    /// The log server could not bind.
    #[error("failed to start log server: {0}")]
    LogServer(#[source] ListenerError),
}
