//! Ephemeral daemon fixtures for integration tests.
//!
//! A [`Session`] owns the process-wide pieces every fixture shares: the event
//! listener that taps daemon pub/sub traffic, the log server that folds daemon
//! logs into the host's `tracing` output, and the registry that guarantees no
//! daemon outlives the session. A [`Factory`] turns a declarative
//! [`DaemonSpec`] into a running process, waits for its readiness checks, and
//! hands back a [`DaemonHandle`] that stops the daemon when dropped.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use corral::{DaemonSpec, Factory, ReadinessCheck, Session};
//! use corral_config::SessionConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::start(SessionConfig::default())?;
//! let factory = Factory::new(session);
//! let spec = DaemonSpec::builder("master-1", "/usr/bin/salt-master")
//!     .readiness(ReadinessCheck::tcp_port(4506))
//!     .forward_events(true)
//!     .build()?;
//! let master = factory.spawn_with_timeout(spec, Duration::from_secs(10))?;
//! let event = master.wait_for_event("job/*/complete", Duration::from_secs(5))?;
//! assert_eq!(event.daemon_id, "master-1");
//! master.stop(Duration::from_secs(5))?;
//! # Ok(())
//! # }
//! ```

mod deadline;
pub mod error;
pub mod events;
mod factory;
mod handle;
pub mod logs;
pub mod ports;
pub mod process;
pub mod readiness;
pub mod reporter;
mod session;
mod spec;
pub mod telemetry;
mod transport;

pub use self::error::{
    EventTimeoutError, ExitSummary, ProcessStartError, ReadinessTimeoutError, SessionError, SpawnError,
    StartFailure, TerminationError, TerminationFailure,
};
pub use self::events::{EventListener, EventRecord, Subscription, TagPattern};
pub use self::factory::Factory;
pub use self::handle::DaemonHandle;
pub use self::logs::{CollectingSink, LogRecord, LogServer, LogSink, TracingSink};
pub use self::process::{ProcessResult, ProcessState, Supervisor};
pub use self::readiness::{
    Probe, ProbeContext, ProbeOutcome, ReadinessCheck, ReadinessChecker, ReadinessFailure, ReadinessReport,
};
pub use self::reporter::{LifecycleReporter, RecordingReporter, StructuredReporter};
pub use self::session::{Session, SessionBuilder, TeardownReport};
pub use self::spec::{DaemonSpec, DaemonSpecBuilder, HookError, LifecycleHook, SpecError};
pub use self::transport::ListenerError;
