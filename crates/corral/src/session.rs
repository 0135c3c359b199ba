//! Session-scoped state: the shared channels and the registry of live daemons.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use corral_config::SessionConfig;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SpawnError};
use crate::events::EventListener;
use crate::logs::{LogServer, LogSink, TracingSink};
use crate::process::{ChannelDetach, Supervisor};
use crate::readiness::ReadinessChecker;
use crate::reporter::{LifecycleReporter, StructuredReporter};

const SESSION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::session");

/// Time a stopped daemon's connections get to deliver their last frames.
const CHANNEL_DRAIN: Duration = Duration::from_millis(500);

struct Channels {
    events: Arc<EventListener>,
    logs: Arc<LogServer>,
}

impl ChannelDetach for Channels {
    fn detach(&self, daemon_id: &str) {
        let events = self.events.detach(daemon_id, CHANNEL_DRAIN);
        let logs = self.logs.detach(daemon_id, CHANNEL_DRAIN);
        debug!(
            target: SESSION_TARGET,
            daemon_id,
            events,
            logs,
            "detached daemon channels"
        );
    }
}

/// What [`Session::teardown`] had to clean up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Daemons that were still registered and had to be stopped.
    pub swept: Vec<String>,
    /// Daemons whose termination failed, with the reason.
    pub failures: Vec<(String, String)>,
}

impl TeardownReport {
    /// Whether every daemon had already been stopped by its owner.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.swept.is_empty() && self.failures.is_empty()
    }
}

/// Process-wide fixture state shared by every daemon of one test session.
///
/// Owns the event listener and log server and tracks every live daemon.
/// [`Session::teardown`] (also run on drop) force-stops whatever is still
/// registered, so no daemon outlives the session even when a test leaks
/// its handle.
pub struct Session {
    config: SessionConfig,
    channels: Arc<Channels>,
    reporter: Arc<dyn LifecycleReporter>,
    daemons: Mutex<BTreeMap<String, Arc<Supervisor>>>,
    closed: AtomicBool,
}

/// Collaborators for a [`Session`]; defaults log through `tracing`.
pub struct SessionBuilder {
    config: SessionConfig,
    reporter: Arc<dyn LifecycleReporter>,
    log_sink: Arc<dyn LogSink>,
}

impl SessionBuilder {
    /// Replaces the lifecycle reporter.
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn LifecycleReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replaces the sink daemon log records are forwarded into.
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// Binds the event listener and log server.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] naming the channel that failed to bind.
    pub fn start(self) -> Result<Arc<Session>, SessionError> {
        let events = EventListener::start(self.config.event_endpoint(), self.config.event_retention())
            .map_err(SessionError::EventListener)?;
        let logs = LogServer::start(self.config.log_endpoint(), self.log_sink)
            .map_err(SessionError::LogServer)?;
        info!(
            target: SESSION_TARGET,
            events = %events.local_endpoint(),
            logs = %logs.local_endpoint(),
            "session started"
        );
        Ok(Arc::new(Session {
            config: self.config,
            channels: Arc::new(Channels {
                events: Arc::new(events),
                logs: Arc::new(logs),
            }),
            reporter: self.reporter,
            daemons: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

impl Session {
    /// Starts a session with the default collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] naming the channel that failed to bind.
    pub fn start(config: SessionConfig) -> Result<Arc<Self>, SessionError> {
        Self::builder(config).start()
    }

    /// Starts configuring a session.
    #[must_use]
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            reporter: Arc::new(StructuredReporter::new()),
            log_sink: Arc::new(TracingSink::new()),
        }
    }

    /// Configuration the session was started with.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session-wide event listener.
    #[must_use]
    pub fn events(&self) -> &EventListener {
        &self.channels.events
    }

    /// Session-wide log server.
    #[must_use]
    pub fn logs(&self) -> &LogServer {
        &self.channels.logs
    }

    /// Ids of the daemons currently registered.
    #[must_use]
    pub fn active_daemons(&self) -> Vec<String> {
        self.daemons().keys().cloned().collect()
    }

    /// Whether [`Session::teardown`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn shared_events(&self) -> Arc<EventListener> {
        Arc::clone(&self.channels.events)
    }

    pub(crate) fn channels(&self) -> Arc<dyn ChannelDetach> {
        Arc::clone(&self.channels) as Arc<dyn ChannelDetach>
    }

    pub(crate) fn reporter(&self) -> Arc<dyn LifecycleReporter> {
        Arc::clone(&self.reporter)
    }

    pub(crate) const fn checker(&self) -> ReadinessChecker {
        ReadinessChecker::new(self.config.poll_interval())
    }

    /// Tracks `supervisor` until it is unregistered or the session ends.
    ///
    /// An entry whose process already reached a terminal state is replaced.
    pub(crate) fn register(&self, supervisor: &Arc<Supervisor>) -> Result<(), SpawnError> {
        let id = supervisor.id().to_owned();
        let mut daemons = self.daemons();
        if self.is_closed() {
            return Err(SpawnError::SessionClosed(id));
        }
        if daemons
            .get(&id)
            .is_some_and(|existing| !existing.state().is_terminal())
        {
            return Err(SpawnError::DuplicateId(id));
        }
        daemons.insert(id, Arc::clone(supervisor));
        Ok(())
    }

    /// Forgets `supervisor`, leaving any newer daemon with the same id alone.
    pub(crate) fn unregister(&self, supervisor: &Arc<Supervisor>) {
        let mut daemons = self.daemons();
        if daemons
            .get(supervisor.id())
            .is_some_and(|existing| Arc::ptr_eq(existing, supervisor))
        {
            daemons.remove(supervisor.id());
        }
    }

    /// Stops every daemon still registered, then closes both channels.
    ///
    /// Termination failures are logged and collected rather than raised so
    /// teardown never masks the failure that ended a test. Later calls find
    /// nothing left to do.
    pub fn teardown(&self) -> TeardownReport {
        let leftovers: Vec<Arc<Supervisor>> = {
            let mut daemons = self.daemons();
            if self.closed.swap(true, Ordering::SeqCst) {
                return TeardownReport::default();
            }
            std::mem::take(&mut *daemons).into_values().collect()
        };

        let mut report = TeardownReport::default();
        for supervisor in leftovers {
            if supervisor.state().is_terminal() {
                continue;
            }
            let grace = supervisor
                .spec()
                .stop_grace_period()
                .unwrap_or(self.config.stop_grace_period());
            report.swept.push(supervisor.id().to_owned());
            if let Err(error) = supervisor.stop(grace) {
                warn!(
                    target: SESSION_TARGET,
                    daemon_id = supervisor.id(),
                    error = %error,
                    "failed to stop daemon during teardown"
                );
                report
                    .failures
                    .push((supervisor.id().to_owned(), error.to_string()));
            }
        }
        if !report.swept.is_empty() {
            self.reporter.teardown_swept(report.swept.len());
        }

        self.channels.events.shutdown();
        self.channels.logs.shutdown();
        info!(
            target: SESSION_TARGET,
            swept = report.swept.len(),
            failures = report.failures.len(),
            "session torn down"
        );
        report
    }

    fn daemons(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Supervisor>>> {
        self.daemons.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Session")
            .field("events", self.events().local_endpoint())
            .field("logs", self.logs().local_endpoint())
            .field("daemons", &self.active_daemons())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let report = self.teardown();
        if !report.is_clean() {
            debug!(
                target: SESSION_TARGET,
                swept = ?report.swept,
                "session dropped with live daemons"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    use crate::reporter::RecordingReporter;
    use crate::spec::DaemonSpec;

    #[fixture]
    fn session() -> Arc<Session> {
        Session::start(SessionConfig::default()).expect("session starts")
    }

    fn supervisor(id: &str) -> Arc<Supervisor> {
        let spec = DaemonSpec::builder(id, "/bin/sh")
            .args(["-c", "sleep 30"])
            .build()
            .expect("valid spec");
        Arc::new(Supervisor::new(spec))
    }

    #[rstest]
    fn channels_bind_ephemeral_ports(session: Arc<Session>) {
        assert_ne!(session.events().local_endpoint().tcp_port(), Some(0));
        assert_ne!(session.logs().local_endpoint().tcp_port(), Some(0));
    }

    #[rstest]
    fn duplicate_live_ids_are_rejected(session: Arc<Session>) {
        let first = supervisor("master-1");
        first.start().expect("start");
        session.register(&first).expect("first registration");
        let second = supervisor("master-1");
        let error = session.register(&second).expect_err("duplicate");
        assert!(matches!(error, SpawnError::DuplicateId(id) if id == "master-1"));
        first.stop(Duration::from_secs(2)).expect("stop");
    }

    #[rstest]
    fn terminal_entries_are_replaced(session: Arc<Session>) {
        let first = supervisor("minion-1");
        first.start().expect("start");
        session.register(&first).expect("register");
        first.stop(Duration::from_secs(2)).expect("stop");
        let second = supervisor("minion-1");
        session.register(&second).expect("replacement");
        session.unregister(&first);
        assert_eq!(session.active_daemons(), vec!["minion-1".to_owned()]);
    }

    #[rstest]
    fn teardown_sweeps_leaked_daemons_once() {
        let reporter = Arc::new(RecordingReporter::new());
        let session = Session::builder(SessionConfig::default())
            .reporter(Arc::clone(&reporter) as Arc<dyn LifecycleReporter>)
            .start()
            .expect("session starts");
        let leaked = supervisor("leaked");
        leaked.start().expect("start");
        session.register(&leaked).expect("register");

        let report = session.teardown();
        assert_eq!(report.swept, vec!["leaked".to_owned()]);
        assert!(report.failures.is_empty());
        assert!(leaked.state().is_terminal());
        assert!(session.active_daemons().is_empty());
        assert!(reporter.lines().contains(&"swept 1".to_owned()));

        assert!(session.teardown().is_clean());
        let late = supervisor("late");
        assert!(matches!(
            session.register(&late),
            Err(SpawnError::SessionClosed(_))
        ));
    }
}
