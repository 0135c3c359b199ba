//! Turns a [`DaemonSpec`] into a ready, supervised daemon.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use corral_wire::DaemonEnvironment;
use tracing::warn;

use crate::error::SpawnError;
use crate::handle::DaemonHandle;
use crate::process::{ProcessState, Supervisor, Wiring};
use crate::readiness::{ProbeContext, ReadinessFailure};
use crate::session::Session;
use crate::spec::DaemonSpec;

const FACTORY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::factory");

/// Stderr lines attached to an early-exit error.
const STDERR_TAIL_LINES: usize = 20;

/// Spawns daemons into a [`Session`].
///
/// Cloning is cheap and every clone spawns into the same session, so one
/// factory can be shared across test threads.
#[derive(Debug, Clone)]
pub struct Factory {
    session: Arc<Session>,
}

impl Factory {
    /// Builds a factory bound to `session`.
    #[must_use]
    pub const fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Session daemons are spawned into.
    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Launches `spec` and waits for its readiness checks using the spec's
    /// start timeout, or the session default.
    ///
    /// # Errors
    ///
    /// See [`Factory::spawn_with_timeout`].
    pub fn spawn(&self, spec: DaemonSpec) -> Result<DaemonHandle, SpawnError> {
        let timeout = spec
            .start_timeout()
            .unwrap_or(self.session.config().start_timeout());
        self.spawn_with_timeout(spec, timeout)
    }

    /// Launches `spec` and blocks until every readiness check has passed.
    ///
    /// An attempt that times out or exits early is force-stopped and, while
    /// attempts remain, retried with a fresh process. On failure no process
    /// from any attempt is left running.
    ///
    /// # Errors
    ///
    /// - [`SpawnError::Start`] when the executable cannot be launched; never
    ///   retried.
    /// - [`SpawnError::Readiness`] when the last attempt timed out.
    /// - [`SpawnError::Exited`] when the last attempt exited before it was
    ///   ready.
    /// - [`SpawnError::DuplicateId`] or [`SpawnError::SessionClosed`] when
    ///   the session refuses the daemon.
    pub fn spawn_with_timeout(
        &self,
        daemon: DaemonSpec,
        timeout: Duration,
    ) -> Result<DaemonHandle, SpawnError> {
        let spec = Arc::new(daemon);
        let attempts = spec
            .max_start_attempts()
            .unwrap_or(self.session.config().max_start_attempts())
            .max(1);
        let reporter = self.session.reporter();
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            reporter.daemon_starting(spec.id(), attempt);
            let supervisor = Arc::new(Supervisor::wired(Arc::clone(&spec), self.wiring(&spec)));
            self.session.register(&supervisor)?;
            let pid = supervisor.start().inspect_err(|_| {
                self.session.unregister(&supervisor);
            })?;

            let started_at = supervisor.started_at().unwrap_or_else(SystemTime::now);
            let events = self.session.events();
            let context = ProbeContext::new(spec.id(), Some(pid), started_at).with_events(events);
            let outcome = self.session.checker().await_ready(
                spec.checks(),
                timeout,
                &context,
                supervisor.as_ref(),
            );

            let error = match outcome {
                Ok(report) => {
                    if let Err(transition) = supervisor
                        .advance(ProcessState::Ready)
                        .and_then(|()| supervisor.advance(ProcessState::Running))
                    {
                        warn!(
                            target: FACTORY_TARGET,
                            daemon_id = spec.id(),
                            error = %transition,
                            "daemon was stopped while becoming ready"
                        );
                        self.session.unregister(&supervisor);
                        return Err(SpawnError::SessionClosed(spec.id().to_owned()));
                    }
                    reporter.daemon_ready(spec.id(), report.elapsed);
                    return Ok(DaemonHandle::new(
                        supervisor,
                        &self.session,
                        self.grace_for(&spec),
                    ));
                }
                Err(ReadinessFailure::TimedOut(mut error)) => {
                    error.attempts = attempt;
                    self.discard(&supervisor, &error);
                    SpawnError::Readiness(error)
                }
                Err(ReadinessFailure::Exited(status)) => {
                    self.discard(&supervisor, &format_args!("exited during start with {status}"));
                    SpawnError::Exited {
                        daemon_id: spec.id().to_owned(),
                        status,
                        attempts: attempt,
                        stderr_tail: supervisor.stderr_tail(STDERR_TAIL_LINES),
                    }
                }
            };

            reporter.start_attempt_failed(spec.id(), attempt, &error);
            if attempt >= attempts {
                return Err(error);
            }
        }
    }

    /// Force-stops a failed attempt and forgets it.
    fn discard(&self, supervisor: &Arc<Supervisor>, reason: &dyn std::fmt::Display) {
        if let Err(error) = supervisor.abort(reason) {
            warn!(
                target: FACTORY_TARGET,
                daemon_id = supervisor.id(),
                error = %error,
                "failed to stop daemon after a failed start"
            );
        }
        self.session.unregister(supervisor);
    }

    fn wiring(&self, spec: &DaemonSpec) -> Wiring {
        let config = self.session.config();
        let environment = DaemonEnvironment {
            daemon_id: spec.id().to_owned(),
            event_endpoint: spec
                .forwards_events()
                .then(|| self.session.events().local_endpoint().clone()),
            log_endpoint: spec
                .forwards_logs()
                .then(|| self.session.logs().local_endpoint().clone()),
            log_level: config.forward_level(),
            log_prefix: spec.log_prefix.clone(),
        };
        Wiring {
            env: environment.to_vars(),
            reporter: self.session.reporter(),
            channels: Some(self.session.channels()),
            capture_lines: config.output_capture_lines(),
        }
    }

    fn grace_for(&self, spec: &DaemonSpec) -> Duration {
        spec.stop_grace_period()
            .unwrap_or(self.session.config().stop_grace_period())
    }
}
