//! Caller-facing handle to a ready daemon.

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use tracing::warn;

use crate::error::{EventTimeoutError, TerminationError};
use crate::events::{EventListener, EventRecord, Subscription, TagPattern, wait_on};
use crate::process::{ProcessResult, ProcessState, Supervisor};
use crate::session::Session;

const HANDLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::handle");

/// A running daemon returned by [`crate::Factory::spawn`].
///
/// Dropping the handle stops the daemon with its default grace period, so a
/// test that panics still cleans up. Call [`DaemonHandle::stop`] to pick the
/// grace period or observe termination errors.
pub struct DaemonHandle {
    supervisor: Arc<Supervisor>,
    events: Arc<EventListener>,
    session: Weak<Session>,
    default_grace: Duration,
}

impl DaemonHandle {
    pub(crate) fn new(supervisor: Arc<Supervisor>, session: &Arc<Session>, default_grace: Duration) -> Self {
        Self {
            supervisor,
            events: session.shared_events(),
            session: Arc::downgrade(session),
            default_grace,
        }
    }

    /// Daemon identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        self.supervisor.id()
    }

    /// OS process id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.supervisor.state()
    }

    /// When the process was launched.
    #[must_use]
    pub fn started_at(&self) -> Option<SystemTime> {
        self.supervisor.started_at()
    }

    /// Whether the daemon is still `Running`. A daemon found dead is marked
    /// `Failed`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.supervisor.poll_exit().is_none() && self.state() == ProcessState::Running
    }

    /// Underlying supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Subscribes to future events from this daemon matching `pattern`.
    #[must_use]
    pub fn subscribe(&self, pattern: impl Into<TagPattern>) -> Subscription {
        self.events.subscribe_to(self.id(), pattern)
    }

    /// Blocks until this daemon publishes an event matching `pattern`.
    ///
    /// Only events received after the call are considered; use
    /// [`DaemonHandle::events_since_start`] for earlier ones.
    ///
    /// # Errors
    ///
    /// Returns [`EventTimeoutError`] when nothing matched within `timeout`
    /// or the session's listener shut down.
    pub fn wait_for_event(
        &self,
        pattern: impl Into<TagPattern>,
        timeout: Duration,
    ) -> Result<EventRecord, EventTimeoutError> {
        let subscription = self.subscribe(pattern);
        wait_on(&subscription, timeout)
    }

    /// Retained events from this daemon matching `pattern` since launch.
    #[must_use]
    pub fn events_since_start(&self, pattern: impl Into<TagPattern>) -> Vec<EventRecord> {
        let after = self.started_at().unwrap_or(SystemTime::UNIX_EPOCH);
        self.events
            .events_since(&pattern.into(), after, Some(self.id()))
    }

    /// Stops the daemon, waiting up to `grace` before killing it.
    ///
    /// Idempotent. The daemon is removed from the session registry even if
    /// termination fails.
    ///
    /// # Errors
    ///
    /// Returns [`TerminationError`] when the process survives the forced
    /// kill.
    pub fn stop(&self, grace: Duration) -> Result<(), TerminationError> {
        let outcome = self.supervisor.stop(grace);
        if let Some(session) = self.session.upgrade() {
            session.unregister(&self.supervisor);
        }
        outcome
    }

    /// Exit status and captured output, once the daemon has terminated.
    #[must_use]
    pub fn result(&self) -> Option<ProcessResult> {
        self.supervisor.result()
    }

    /// Last `count` lines the daemon wrote to standard error.
    #[must_use]
    pub fn stderr_tail(&self, count: usize) -> Vec<String> {
        self.supervisor.stderr_tail(count)
    }
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DaemonHandle")
            .field("supervisor", &self.supervisor)
            .field("default_grace", &self.default_grace)
            .finish_non_exhaustive()
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if let Err(error) = self.stop(self.default_grace) {
            warn!(
                target: HANDLE_TARGET,
                daemon_id = self.id(),
                error = %error,
                "failed to stop daemon when its handle was dropped"
            );
        }
    }
}
