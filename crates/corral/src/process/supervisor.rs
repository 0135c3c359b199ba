//! Owns one OS subprocess and drives it through its lifecycle.

use std::io;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use super::output::{OutputCapture, spawn_drain};
use super::signal::{self, Delivery, StopSignal};
use super::state::{InvalidTransition, ProcessState};
use super::{DRAIN_JOIN, EXIT_POLL, KILL_WAIT, PROCESS_TARGET, command};
use crate::error::{ExitSummary, ProcessStartError, StartFailure, TerminationError, TerminationFailure};
use crate::reporter::{LifecycleReporter, StructuredReporter};
use crate::spec::{DaemonSpec, HookError, LifecycleHook};

/// Releases the event and log channels a daemon was attached to.
pub(crate) trait ChannelDetach: Send + Sync {
    fn detach(&self, daemon_id: &str);
}

/// Everything a supervisor needs from its session.
pub(crate) struct Wiring {
    /// Variables injected on top of the spec's overlay.
    pub(crate) env: Vec<(&'static str, String)>,
    pub(crate) reporter: Arc<dyn LifecycleReporter>,
    pub(crate) channels: Option<Arc<dyn ChannelDetach>>,
    pub(crate) capture_lines: usize,
}

impl Default for Wiring {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            reporter: Arc::new(StructuredReporter::new()),
            channels: None,
            capture_lines: corral_config::defaults::DEFAULT_OUTPUT_CAPTURE_LINES,
        }
    }
}

/// What a daemon left behind once it terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal, when the process was killed.
    pub signal: Option<i32>,
    /// Last captured lines of standard output.
    pub stdout: Vec<String>,
    /// Last captured lines of standard error.
    pub stderr: Vec<String>,
    /// Program and arguments that were run.
    pub cmdline: Vec<String>,
}

#[derive(Debug)]
struct DaemonProcess {
    child: Option<Child>,
    state: ProcessState,
    pid: Option<u32>,
    started_at: Option<SystemTime>,
    exit: Option<ExitSummary>,
}

impl DaemonProcess {
    /// Records the exit if the child has terminated.
    fn reap(&mut self) -> io::Result<Option<ExitSummary>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let exit = child.try_wait()?.map(summarise);
        self.exit = exit;
        Ok(exit)
    }
}

/// Supervises one daemon process.
///
/// Every state change happens under a per-process lock, so a concurrent
/// [`Supervisor::stop`] and a readiness failure cannot race into an
/// inconsistent state. Stops are serialised and idempotent.
pub struct Supervisor {
    spec: Arc<DaemonSpec>,
    wiring: Wiring,
    inner: Mutex<DaemonProcess>,
    stop_lock: Mutex<()>,
    finished: AtomicBool,
    stdout: OutputCapture,
    stderr: OutputCapture,
    drains: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Builds a supervisor for `spec` that reports through `tracing` and is
    /// not attached to any session channels.
    #[must_use]
    pub fn new(spec: DaemonSpec) -> Self {
        Self::wired(Arc::new(spec), Wiring::default())
    }

    pub(crate) fn wired(spec: Arc<DaemonSpec>, wiring: Wiring) -> Self {
        let capacity = wiring.capture_lines;
        Self {
            spec,
            wiring,
            inner: Mutex::new(DaemonProcess {
                child: None,
                state: ProcessState::Created,
                pid: None,
                started_at: None,
                exit: None,
            }),
            stop_lock: Mutex::new(()),
            finished: AtomicBool::new(false),
            stdout: OutputCapture::new(capacity),
            stderr: OutputCapture::new(capacity),
            drains: Mutex::new(Vec::new()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, DaemonProcess> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Daemon identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        self.spec.id()
    }

    /// Spec the daemon was launched from.
    #[must_use]
    pub fn spec(&self) -> &DaemonSpec {
        &self.spec
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.inner().state
    }

    /// OS process id, once launched.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner().pid
    }

    /// Wall-clock launch time, once launched.
    #[must_use]
    pub fn started_at(&self) -> Option<SystemTime> {
        self.inner().started_at
    }

    /// Launches the process and moves it from `Created` to `Starting`.
    ///
    /// On failure the state becomes `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessStartError`] when the executable cannot be launched or
    /// the supervisor was already started.
    pub fn start(&self) -> Result<u32, ProcessStartError> {
        self.run_hooks("before_start", |hook| hook.before_start(self.id()));
        let mut inner = self.inner();
        if inner.state != ProcessState::Created {
            return Err(self.start_error(StartFailure::AlreadyStarted(inner.state)));
        }
        self.set_state(&mut inner, ProcessState::Starting);

        let mut command = command::build(&self.spec, &self.wiring.env);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.set_state(&mut inner, ProcessState::Failed);
                drop(inner);
                self.finished.store(true, Ordering::SeqCst);
                let error = self.start_error(StartFailure::from_io(source));
                self.wiring.reporter.daemon_failed(self.id(), &error);
                return Err(error);
            }
        };
        let pid = child.id();
        self.attach_drains(&mut child);
        inner.child = Some(child);
        inner.pid = Some(pid);
        inner.started_at = Some(SystemTime::now());
        drop(inner);

        debug!(
            target: PROCESS_TARGET,
            daemon_id = self.id(),
            pid,
            cmdline = ?self.spec.cmdline(),
            "daemon process launched"
        );
        self.wiring.reporter.daemon_started(self.id(), pid);
        self.run_hooks("after_start", |hook| hook.after_start(self.id(), pid));
        Ok(pid)
    }

    fn start_error(&self, reason: StartFailure) -> ProcessStartError {
        ProcessStartError {
            daemon_id: self.id().to_owned(),
            program: self.spec.program().display().to_string(),
            reason,
        }
    }

    fn attach_drains(&self, child: &mut Child) {
        let mut drains = self.drains.lock().unwrap_or_else(PoisonError::into_inner);
        let readers = [
            child
                .stdout
                .take()
                .map(|stream| spawn_drain(stream, self.id(), "stdout", self.stdout.clone())),
            child
                .stderr
                .take()
                .map(|stream| spawn_drain(stream, self.id(), "stderr", self.stderr.clone())),
        ];
        for reader in readers.into_iter().flatten() {
            match reader {
                Ok(handle) => drains.push(handle),
                Err(error) => warn!(
                    target: PROCESS_TARGET,
                    daemon_id = self.id(),
                    error = %error,
                    "failed to spawn output reader"
                ),
            }
        }
    }

    /// Moves the process along a forward edge of the lifecycle.
    pub(crate) fn advance(&self, next: ProcessState) -> Result<(), InvalidTransition> {
        let mut inner = self.inner();
        if !inner.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: inner.state,
                to: next,
            });
        }
        self.set_state(&mut inner, next);
        Ok(())
    }

    fn set_state(&self, inner: &mut DaemonProcess, next: ProcessState) {
        if !inner.state.can_transition_to(next) {
            warn!(
                target: PROCESS_TARGET,
                daemon_id = self.id(),
                from = %inner.state,
                to = %next,
                "ignoring invalid state transition"
            );
            return;
        }
        debug!(
            target: PROCESS_TARGET,
            daemon_id = self.id(),
            from = %inner.state,
            to = %next,
            "state transition"
        );
        inner.state = next;
    }

    /// Checks whether the process has exited without blocking.
    ///
    /// A `Running` daemon found dead is marked `Failed`.
    #[must_use]
    pub fn poll_exit(&self) -> Option<ExitSummary> {
        let mut inner = self.inner();
        let exit = match inner.reap() {
            Ok(exit) => exit?,
            Err(error) => {
                debug!(
                    target: PROCESS_TARGET,
                    daemon_id = self.id(),
                    error = %error,
                    "exit status unavailable"
                );
                return None;
            }
        };
        if inner.state == ProcessState::Running {
            self.set_state(&mut inner, ProcessState::Failed);
            drop(inner);
            self.wiring
                .reporter
                .daemon_failed(self.id(), &format_args!("exited unexpectedly with {exit}"));
        }
        Some(exit)
    }

    /// Stops the daemon, waiting up to `grace` after the graceful signal
    /// before killing it.
    ///
    /// Idempotent: on a stopped, failed, or never-started process this only
    /// finishes any outstanding cleanup. Closes the output pipes and detaches
    /// the daemon's channels.
    ///
    /// # Errors
    ///
    /// Returns [`TerminationError`] when the process survives the forced
    /// kill; the state then becomes `Failed`.
    pub fn stop(&self, grace: Duration) -> Result<(), TerminationError> {
        self.shut_down(grace, None)
    }

    /// Kills the daemon outright and marks it `Failed` with `reason`.
    pub(crate) fn abort(&self, reason: &dyn std::fmt::Display) -> Result<(), TerminationError> {
        self.shut_down(Duration::ZERO, Some(reason))
    }

    fn shut_down(
        &self,
        grace: Duration,
        failure: Option<&dyn std::fmt::Display>,
    ) -> Result<(), TerminationError> {
        let _serial = self.stop_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, pid) = {
            let inner = self.inner();
            (inner.state, inner.pid)
        };
        let Some(pid) = pid.filter(|_| !state.is_terminal() && state != ProcessState::Created)
        else {
            if state.is_terminal() {
                self.finish();
            }
            return Ok(());
        };
        if failure.is_none()
            && state == ProcessState::Running
            && let Some(exit) = self.poll_exit()
        {
            // An unobserved crash stays Failed.
            self.clear_group(pid);
            self.wiring.reporter.daemon_stopped(self.id(), Some(exit));
            self.finish();
            return Ok(());
        }

        self.advance_quietly(ProcessState::Stopping);
        self.wiring.reporter.daemon_stopping(self.id(), grace);
        self.run_hooks("before_stop", |hook| hook.before_stop(self.id()));

        let slow = failure.is_none() && self.spec.slow_stop();
        let outcome = self.terminate(pid, grace, slow);
        let result = match (outcome, failure) {
            (Ok(exit), None) => {
                self.advance_quietly(ProcessState::Stopped);
                self.wiring.reporter.daemon_stopped(self.id(), Some(exit));
                Ok(())
            }
            (Ok(exit), Some(reason)) => {
                self.advance_quietly(ProcessState::Failed);
                self.wiring.reporter.daemon_failed(self.id(), reason);
                self.wiring.reporter.daemon_stopped(self.id(), Some(exit));
                Ok(())
            }
            (Err(reason), _) => {
                self.advance_quietly(ProcessState::Failed);
                let error = TerminationError {
                    daemon_id: self.id().to_owned(),
                    pid,
                    reason,
                };
                self.wiring.reporter.daemon_failed(self.id(), &error);
                Err(error)
            }
        };
        self.finish();
        result
    }

    fn advance_quietly(&self, next: ProcessState) {
        let mut inner = self.inner();
        self.set_state(&mut inner, next);
    }

    /// Graceful signal, bounded wait, forced kill, bounded wait.
    fn terminate(&self, pid: u32, grace: Duration, slow: bool) -> Result<ExitSummary, TerminationFailure> {
        if let Some(exit) = self.wait_exit(Duration::ZERO)? {
            self.clear_group(pid);
            return Ok(exit);
        }
        if slow {
            match self.deliver(pid, StopSignal::Graceful) {
                Ok(Delivery::Sent | Delivery::Gone) => {}
                Err(error) => debug!(
                    target: PROCESS_TARGET,
                    daemon_id = self.id(),
                    pid,
                    error = %error,
                    "graceful signal not delivered; escalating"
                ),
            }
            if let Some(exit) = self.wait_exit(grace)? {
                self.clear_group(pid);
                return Ok(exit);
            }
            debug!(
                target: PROCESS_TARGET,
                daemon_id = self.id(),
                pid,
                "grace period elapsed; killing"
            );
        }

        let delivery = self.kill(pid);
        if let Some(exit) = self.wait_exit(KILL_WAIT)? {
            self.clear_group(pid);
            return Ok(exit);
        }
        Err(match delivery {
            Err(source) => TerminationFailure::Signal {
                signal: StopSignal::Forced.name(),
                source,
            },
            Ok(_) => TerminationFailure::DidNotExit { waited: KILL_WAIT },
        })
    }

    fn kill(&self, pid: u32) -> io::Result<Delivery> {
        match self.deliver(pid, StopSignal::Forced) {
            Err(error) if error.kind() == io::ErrorKind::Unsupported => {
                let mut inner = self.inner();
                match inner.child.as_mut() {
                    Some(child) => child.kill().map(|()| Delivery::Sent),
                    None => Ok(Delivery::Gone),
                }
            }
            other => other,
        }
    }

    /// Signals the daemon's group. The leader alone is only signalled while
    /// it is unreaped, so its pid cannot belong to another process yet.
    fn deliver(&self, pid: u32, stop: StopSignal) -> io::Result<Delivery> {
        let inner = self.inner();
        if inner.exit.is_some() {
            signal::send_group(pid, stop)
        } else {
            signal::send(pid, stop)
        }
    }

    /// Kills helpers the daemon left behind in its process group.
    fn clear_group(&self, pid: u32) {
        if let Ok(Delivery::Sent) = signal::send_group(pid, StopSignal::Forced) {
            debug!(
                target: PROCESS_TARGET,
                daemon_id = self.id(),
                pid,
                "killed lingering process group members"
            );
        }
    }

    fn wait_exit(&self, budget: Duration) -> Result<Option<ExitSummary>, TerminationFailure> {
        let deadline = crate::deadline::after(budget);
        loop {
            if let Some(exit) = self.inner().reap().map_err(TerminationFailure::Wait)? {
                return Ok(Some(exit));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL);
        }
    }

    /// Joins output readers, detaches channels, and runs `after_stop` hooks.
    /// Runs once.
    fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let drains: Vec<JoinHandle<()>> = self
            .drains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let deadline = Instant::now() + DRAIN_JOIN;
        for drain in drains {
            while !drain.is_finished() && Instant::now() < deadline {
                thread::sleep(EXIT_POLL);
            }
            if drain.is_finished() {
                if drain.join().is_err() {
                    warn!(target: PROCESS_TARGET, daemon_id = self.id(), "output reader panicked");
                }
            } else {
                debug!(
                    target: PROCESS_TARGET,
                    daemon_id = self.id(),
                    "output pipe still held open; leaving reader detached"
                );
            }
        }
        if let Some(channels) = &self.wiring.channels {
            channels.detach(self.id());
        }
        if let Some(result) = self.result() {
            self.run_hooks("after_stop", |hook| hook.after_stop(self.id(), &result));
        }
    }

    /// Exit status and captured output, once the process has terminated.
    #[must_use]
    pub fn result(&self) -> Option<ProcessResult> {
        let exit = self.inner().exit?;
        Some(ProcessResult {
            exit_code: exit.code,
            signal: exit.signal,
            stdout: self.stdout.snapshot(),
            stderr: self.stderr.snapshot(),
            cmdline: self.spec.cmdline(),
        })
    }

    /// Last `count` lines captured from standard error.
    #[must_use]
    pub fn stderr_tail(&self, count: usize) -> Vec<String> {
        self.stderr.tail(count)
    }

    fn run_hooks<F>(&self, stage: &'static str, call: F)
    where
        F: Fn(&dyn LifecycleHook) -> Result<(), HookError>,
    {
        for hook in &self.spec.hooks {
            if let Err(error) = call(hook.as_ref()) {
                warn!(
                    target: PROCESS_TARGET,
                    daemon_id = self.id(),
                    stage,
                    error = %error,
                    "lifecycle hook failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        formatter
            .debug_struct("Supervisor")
            .field("id", &self.id())
            .field("state", &inner.state)
            .field("pid", &inner.pid)
            .finish_non_exhaustive()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(child) = inner.child.as_mut() else {
            return;
        };
        if inner.exit.is_some() || matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        warn!(
            target: PROCESS_TARGET,
            daemon_id = %self.spec.id(),
            pid = child.id(),
            "supervisor dropped with a live process; killing it"
        );
        if signal::send(child.id(), StopSignal::Forced).is_err() && child.kill().is_err() {
            return;
        }
        // Reap so the daemon does not linger as a zombie.
        if child.wait().is_err() {
            debug!(target: PROCESS_TARGET, "failed to reap killed daemon");
        }
    }
}

fn summarise(status: ExitStatus) -> ExitSummary {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    ExitSummary {
        code: status.code(),
        signal,
    }
}
