//! Readiness checks and the fixed-interval poller that evaluates them.
//!
//! A daemon is ready once every declared check has succeeded at least once.
//! Transient probe errors such as a refused connection only mean "not yet";
//! the poller keeps trying until its overall budget runs out.

mod checker;
mod probes;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use corral_config::Endpoint;

use crate::events::{EventListener, TagPattern};

pub use self::checker::{ProcessWatch, ReadinessChecker, ReadinessFailure, ReadinessReport};

const READINESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::readiness");

/// Probe budget used when a check does not set its own.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The condition holds.
    Ready,
    /// The condition does not hold yet; carries what was observed.
    Pending(String),
}

impl ProbeOutcome {
    /// Builds a pending outcome from anything printable.
    #[must_use]
    pub fn pending(observation: impl fmt::Display) -> Self {
        Self::Pending(observation.to_string())
    }
}

/// What a probe may inspect about the daemon under test.
#[derive(Clone, Copy)]
pub struct ProbeContext<'a> {
    daemon_id: &'a str,
    pid: Option<u32>,
    started_at: SystemTime,
    events: Option<&'a EventListener>,
}

impl<'a> ProbeContext<'a> {
    /// Context for a daemon launched at `started_at`.
    #[must_use]
    pub const fn new(daemon_id: &'a str, pid: Option<u32>, started_at: SystemTime) -> Self {
        Self {
            daemon_id,
            pid,
            started_at,
            events: None,
        }
    }

    /// Gives event checks access to the session's listener.
    #[must_use]
    pub const fn with_events(mut self, events: &'a EventListener) -> Self {
        self.events = Some(events);
        self
    }

    /// Daemon identifier.
    #[must_use]
    pub const fn daemon_id(&self) -> &'a str {
        self.daemon_id
    }

    /// OS process id.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the process was launched.
    #[must_use]
    pub const fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Session event listener, when one is attached.
    #[must_use]
    pub const fn events(&self) -> Option<&'a EventListener> {
        self.events
    }
}

impl fmt::Debug for ProbeContext<'_> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ProbeContext")
            .field("daemon_id", &self.daemon_id)
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// Caller-supplied readiness predicate.
pub trait Probe: Send + Sync {
    /// Evaluates the predicate once, taking no longer than `budget`.
    fn probe(&self, context: &ProbeContext<'_>, budget: Duration) -> ProbeOutcome;
}

impl<F> Probe for F
where
    F: Fn(&ProbeContext<'_>, Duration) -> ProbeOutcome + Send + Sync,
{
    fn probe(&self, context: &ProbeContext<'_>, budget: Duration) -> ProbeOutcome {
        self(context, budget)
    }
}

#[derive(Clone)]
enum CheckKind {
    PortOpen(Endpoint),
    PidFile(PathBuf),
    Event(TagPattern),
    Custom(Arc<dyn Probe>),
}

/// One declared readiness condition.
#[derive(Clone)]
pub struct ReadinessCheck {
    label: String,
    kind: CheckKind,
    probe_timeout: Option<Duration>,
}

impl ReadinessCheck {
    /// Ready once a connection to `endpoint` succeeds.
    #[must_use]
    pub fn port_open(endpoint: Endpoint) -> Self {
        Self::with_kind(format!("port {endpoint}"), CheckKind::PortOpen(endpoint))
    }

    /// Ready once `127.0.0.1:port` accepts connections.
    #[must_use]
    pub fn tcp_port(port: u16) -> Self {
        Self::port_open(Endpoint::loopback(port))
    }

    /// Ready once `path` exists and holds a process id.
    #[must_use]
    pub fn pid_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::with_kind(format!("pidfile {}", path.display()), CheckKind::PidFile(path))
    }

    /// Ready once the daemon has published an event matching `pattern`
    /// since it was launched.
    #[must_use]
    pub fn event(pattern: impl Into<TagPattern>) -> Self {
        let pattern = pattern.into();
        Self::with_kind(format!("event {pattern}"), CheckKind::Event(pattern))
    }

    /// Ready once `probe` reports [`ProbeOutcome::Ready`].
    #[must_use]
    pub fn custom<F>(label: impl Into<String>, probe: F) -> Self
    where
        F: Fn(&ProbeContext<'_>, Duration) -> ProbeOutcome + Send + Sync + 'static,
    {
        Self::with_kind(label.into(), CheckKind::Custom(Arc::new(probe)))
    }

    /// Ready once a shared [`Probe`] reports ready.
    #[must_use]
    pub fn probe(label: impl Into<String>, probe: Arc<dyn Probe>) -> Self {
        Self::with_kind(label.into(), CheckKind::Custom(probe))
    }

    fn with_kind(label: String, kind: CheckKind) -> Self {
        Self {
            label,
            kind,
            probe_timeout: None,
        }
    }

    /// Bounds each individual probe. Defaults to [`DEFAULT_PROBE_TIMEOUT`].
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Replaces the label used in diagnostics.
    #[must_use]
    pub fn named(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Name used in diagnostics and timeout errors.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Per-probe budget override.
    #[must_use]
    pub const fn probe_timeout(&self) -> Option<Duration> {
        self.probe_timeout
    }

    /// Evaluates the check once.
    #[must_use]
    pub fn evaluate(&self, context: &ProbeContext<'_>, budget: Duration) -> ProbeOutcome {
        match &self.kind {
            CheckKind::PortOpen(endpoint) => probes::port_open(endpoint, budget),
            CheckKind::PidFile(path) => probes::pid_file(path),
            CheckKind::Event(pattern) => probes::event_seen(pattern, context),
            CheckKind::Custom(probe) => probe.probe(context, budget),
        }
    }
}

impl fmt::Debug for ReadinessCheck {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ReadinessCheck")
            .field("label", &self.label)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}
