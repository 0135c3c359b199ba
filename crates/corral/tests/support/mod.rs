//! Shared helpers for the integration suites.

#![allow(dead_code, reason = "each suite uses a different subset")]

use std::sync::Arc;
use std::time::Duration;

use corral::{
    CollectingSink, DaemonSpec, DaemonSpecBuilder, Factory, LifecycleReporter, LogSink,
    ReadinessCheck, RecordingReporter, Session,
};
use tempfile::TempDir;
use corral_config::SessionConfig;

/// Path of the scriptable fixture daemon.
pub const SAMPLE_DAEMON: &str = env!("CARGO_BIN_EXE_corral-sample-daemon");

/// Generous budget for operations expected to succeed.
pub const SETTLE: Duration = Duration::from_secs(10);

/// Session configuration tuned for quick tests.
pub fn config() -> SessionConfig {
    SessionConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_stop_grace_period(Duration::from_secs(2))
        .with_start_timeout(SETTLE)
}

/// A session with recording collaborators.
pub struct Harness {
    pub factory: Factory,
    pub reporter: Arc<RecordingReporter>,
    pub logs: Arc<CollectingSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let reporter = Arc::new(RecordingReporter::new());
        let logs = Arc::new(CollectingSink::new());
        let session = Session::builder(config)
            .reporter(Arc::clone(&reporter) as Arc<dyn LifecycleReporter>)
            .log_sink(Arc::clone(&logs) as Arc<dyn LogSink>)
            .start()
            .expect("session starts");
        Self {
            factory: Factory::new(session),
            reporter,
            logs,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.factory.session()
    }
}

/// Builder for the sample daemon under `id`.
pub fn sample(id: &str) -> DaemonSpecBuilder {
    DaemonSpec::builder(id, SAMPLE_DAEMON)
}

/// Builder for the sample daemon under `id` that only counts as ready once
/// its signal handlers are installed and its startup output has been sent.
///
/// The daemon writes its pid file into `dir` as the last startup step.
pub fn settled(id: &str, dir: &TempDir) -> DaemonSpecBuilder {
    let pidfile = dir.path().join(format!("{id}.pid"));
    sample(id)
        .arg("--pidfile")
        .arg(pidfile.display().to_string())
        .readiness(ReadinessCheck::pid_file(&pidfile))
}

/// Whether a process with `pid` still exists and is not a zombie.
#[cfg(target_os = "linux")]
pub fn alive(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
        stat.rsplit_once(") ")
            .and_then(|(_, rest)| rest.chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X')
    })
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn alive(pid: u32) -> bool {
    let pid = nix::unistd::Pid::from_raw(i32::try_from(pid).expect("pid fits"));
    nix::sys::signal::kill(pid, None).is_ok()
}
