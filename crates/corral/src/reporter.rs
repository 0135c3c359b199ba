//! Structured reporting for daemon lifecycle events.

use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{ExitSummary, SpawnError};

const LIFECYCLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lifecycle");

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait LifecycleReporter: Send + Sync {
    /// Invoked before a start attempt launches the process.
    fn daemon_starting(&self, daemon_id: &str, attempt: u32);

    /// Invoked once the process has been launched.
    fn daemon_started(&self, daemon_id: &str, pid: u32);

    /// Invoked when every readiness check has passed.
    fn daemon_ready(&self, daemon_id: &str, elapsed: Duration);

    /// Invoked when a start attempt fails and may be retried.
    fn start_attempt_failed(&self, daemon_id: &str, attempt: u32, error: &SpawnError);

    /// Invoked when a daemon enters the failed state.
    fn daemon_failed(&self, daemon_id: &str, reason: &dyn Display);

    /// Invoked before termination signals are sent.
    fn daemon_stopping(&self, daemon_id: &str, grace: Duration);

    /// Invoked once the process has been reaped.
    fn daemon_stopped(&self, daemon_id: &str, exit: Option<ExitSummary>);

    /// Invoked when session teardown had to stop leftover daemons.
    fn teardown_swept(&self, count: usize);
}

impl<T> LifecycleReporter for Arc<T>
where
    T: LifecycleReporter + ?Sized,
{
    fn daemon_starting(&self, daemon_id: &str, attempt: u32) {
        (**self).daemon_starting(daemon_id, attempt);
    }

    fn daemon_started(&self, daemon_id: &str, pid: u32) {
        (**self).daemon_started(daemon_id, pid);
    }

    fn daemon_ready(&self, daemon_id: &str, elapsed: Duration) {
        (**self).daemon_ready(daemon_id, elapsed);
    }

    fn start_attempt_failed(&self, daemon_id: &str, attempt: u32, error: &SpawnError) {
        (**self).start_attempt_failed(daemon_id, attempt, error);
    }

    fn daemon_failed(&self, daemon_id: &str, reason: &dyn Display) {
        (**self).daemon_failed(daemon_id, reason);
    }

    fn daemon_stopping(&self, daemon_id: &str, grace: Duration) {
        (**self).daemon_stopping(daemon_id, grace);
    }

    fn daemon_stopped(&self, daemon_id: &str, exit: Option<ExitSummary>) {
        (**self).daemon_stopped(daemon_id, exit);
    }

    fn teardown_swept(&self, count: usize) {
        (**self).teardown_swept(count);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredReporter;

impl StructuredReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl LifecycleReporter for StructuredReporter {
    fn daemon_starting(&self, daemon_id: &str, attempt: u32) {
        tracing::info!(
            target: LIFECYCLE_TARGET,
            event = "daemon_starting",
            daemon_id,
            attempt,
            "starting daemon"
        );
    }

    fn daemon_started(&self, daemon_id: &str, pid: u32) {
        tracing::debug!(
            target: LIFECYCLE_TARGET,
            event = "daemon_started",
            daemon_id,
            pid,
            "daemon process launched"
        );
    }

    fn daemon_ready(&self, daemon_id: &str, elapsed: Duration) {
        tracing::info!(
            target: LIFECYCLE_TARGET,
            event = "daemon_ready",
            daemon_id,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "daemon ready"
        );
    }

    fn start_attempt_failed(&self, daemon_id: &str, attempt: u32, error: &SpawnError) {
        tracing::warn!(
            target: LIFECYCLE_TARGET,
            event = "start_attempt_failed",
            daemon_id,
            attempt,
            error = %error,
            "daemon start attempt failed"
        );
    }

    fn daemon_failed(&self, daemon_id: &str, reason: &dyn Display) {
        tracing::error!(
            target: LIFECYCLE_TARGET,
            event = "daemon_failed",
            daemon_id,
            reason = %reason,
            "daemon failed"
        );
    }

    fn daemon_stopping(&self, daemon_id: &str, grace: Duration) {
        tracing::info!(
            target: LIFECYCLE_TARGET,
            event = "daemon_stopping",
            daemon_id,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "stopping daemon"
        );
    }

    fn daemon_stopped(&self, daemon_id: &str, exit: Option<ExitSummary>) {
        let status = exit.map_or_else(|| "unknown".to_owned(), |summary| summary.to_string());
        tracing::info!(
            target: LIFECYCLE_TARGET,
            event = "daemon_stopped",
            daemon_id,
            status = %status,
            "daemon stopped"
        );
    }

    fn teardown_swept(&self, count: usize) {
        tracing::warn!(
            target: LIFECYCLE_TARGET,
            event = "teardown_swept",
            count,
            "session teardown stopped leftover daemons"
        );
    }
}

/// Reporter that keeps one line per event, for assertions in tests.
///
/// Lines read `<event> <daemon_id>`, for example `ready master-1`.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    lines: Mutex<Vec<String>>,
}

impl RecordingReporter {
    /// Builds an empty reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded line, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded event names for `daemon_id`, oldest first.
    #[must_use]
    pub fn events_for(&self, daemon_id: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter_map(|line| {
                line.split_once(' ')
                    .filter(|(_, id)| *id == daemon_id)
                    .map(|(event, _)| event.to_owned())
            })
            .collect()
    }

    fn record(&self, event: &str, subject: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{event} {subject}"));
    }
}

impl LifecycleReporter for RecordingReporter {
    fn daemon_starting(&self, daemon_id: &str, _attempt: u32) {
        self.record("starting", daemon_id);
    }

    fn daemon_started(&self, daemon_id: &str, _pid: u32) {
        self.record("started", daemon_id);
    }

    fn daemon_ready(&self, daemon_id: &str, _elapsed: Duration) {
        self.record("ready", daemon_id);
    }

    fn start_attempt_failed(&self, daemon_id: &str, _attempt: u32, _error: &SpawnError) {
        self.record("attempt_failed", daemon_id);
    }

    fn daemon_failed(&self, daemon_id: &str, _reason: &dyn Display) {
        self.record("failed", daemon_id);
    }

    fn daemon_stopping(&self, daemon_id: &str, _grace: Duration) {
        self.record("stopping", daemon_id);
    }

    fn daemon_stopped(&self, daemon_id: &str, _exit: Option<ExitSummary>) {
        self.record("stopped", daemon_id);
    }

    fn teardown_swept(&self, count: usize) {
        self.record("swept", &count.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_reporter_groups_events_by_daemon() {
        let reporter = Arc::new(RecordingReporter::new());
        let shared: Arc<dyn LifecycleReporter> = Arc::clone(&reporter) as Arc<dyn LifecycleReporter>;
        shared.daemon_starting("master-1", 1);
        shared.daemon_starting("minion-1", 1);
        shared.daemon_ready("master-1", Duration::from_millis(120));
        shared.daemon_stopped("master-1", None);

        assert_eq!(
            reporter.events_for("master-1"),
            vec!["starting", "ready", "stopped"]
        );
        assert_eq!(reporter.events_for("minion-1"), vec!["starting"]);
    }

    #[test]
    fn structured_reporter_accepts_every_event() {
        let reporter = StructuredReporter::new();
        reporter.daemon_starting("d1", 1);
        reporter.daemon_started("d1", 42);
        reporter.daemon_ready("d1", Duration::from_millis(5));
        reporter.daemon_failed("d1", &"boom");
        reporter.daemon_stopping("d1", Duration::from_secs(1));
        reporter.daemon_stopped(
            "d1",
            Some(ExitSummary {
                code: Some(0),
                signal: None,
            }),
        );
        reporter.teardown_swept(2);
    }
}
