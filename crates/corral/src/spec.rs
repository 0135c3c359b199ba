//! Declarative daemon specifications.
//!
//! A [`DaemonSpec`] is validated once when built and is immutable afterwards.
//! The factory consumes it to launch, probe, and wire a daemon.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessResult;
use crate::readiness::ReadinessCheck;

/// Prefix reserved for variables the factory injects.
const RESERVED_ENV_PREFIX: &str = "CORRAL_";

/// Error type returned by lifecycle hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Callbacks run around a daemon's start and stop.
///
/// Hook failures are logged and never abort the lifecycle step they
/// surround. Every method defaults to doing nothing.
pub trait LifecycleHook: Send + Sync {
    /// Runs before the process is launched.
    fn before_start(&self, _daemon_id: &str) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs once the process has been launched, before readiness polling.
    fn after_start(&self, _daemon_id: &str, _pid: u32) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs before termination signals are sent.
    fn before_stop(&self, _daemon_id: &str) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs after the process has been reaped.
    fn after_stop(&self, _daemon_id: &str, _result: &ProcessResult) -> Result<(), HookError> {
        Ok(())
    }
}

/// Immutable description of one daemon fixture.
#[derive(Clone)]
pub struct DaemonSpec {
    pub(crate) id: String,
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) env_remove: Vec<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) checks: Vec<ReadinessCheck>,
    pub(crate) forward_events: bool,
    pub(crate) forward_logs: bool,
    pub(crate) log_prefix: Option<String>,
    pub(crate) start_timeout: Option<Duration>,
    pub(crate) stop_grace_period: Option<Duration>,
    pub(crate) max_start_attempts: Option<u32>,
    pub(crate) slow_stop: bool,
    pub(crate) hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl DaemonSpec {
    /// Starts a builder for a daemon called `id` running `program`.
    #[must_use]
    pub fn builder(id: impl Into<String>, program: impl Into<PathBuf>) -> DaemonSpecBuilder {
        DaemonSpecBuilder {
            spec: Self {
                id: id.into(),
                program: program.into(),
                args: Vec::new(),
                env: BTreeMap::new(),
                env_remove: Vec::new(),
                cwd: None,
                checks: Vec::new(),
                forward_events: false,
                forward_logs: false,
                log_prefix: None,
                start_timeout: None,
                stop_grace_period: None,
                max_start_attempts: None,
                slow_stop: true,
                hooks: Vec::new(),
            },
        }
    }

    /// Daemon identifier, unique among live daemons in a session.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Executable path.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments passed to the executable.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment overlay applied on top of the host environment.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Working directory, when one was set.
    #[must_use]
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Declared readiness checks.
    #[must_use]
    pub fn checks(&self) -> &[ReadinessCheck] {
        &self.checks
    }

    /// Whether the daemon is wired to the event channel.
    #[must_use]
    pub const fn forwards_events(&self) -> bool {
        self.forward_events
    }

    /// Whether the daemon is wired to the log channel.
    #[must_use]
    pub const fn forwards_logs(&self) -> bool {
        self.forward_logs
    }

    /// Whether termination starts with a graceful signal.
    #[must_use]
    pub const fn slow_stop(&self) -> bool {
        self.slow_stop
    }

    /// Per-daemon spawn budget, overriding the session default.
    #[must_use]
    pub const fn start_timeout(&self) -> Option<Duration> {
        self.start_timeout
    }

    /// Per-daemon grace period, overriding the session default.
    #[must_use]
    pub const fn stop_grace_period(&self) -> Option<Duration> {
        self.stop_grace_period
    }

    /// Per-daemon attempt count, overriding the session default.
    #[must_use]
    pub const fn max_start_attempts(&self) -> Option<u32> {
        self.max_start_attempts
    }

    /// Renders the command line for diagnostics.
    #[must_use]
    pub fn cmdline(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Debug for DaemonSpec {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DaemonSpec")
            .field("id", &self.id)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("cwd", &self.cwd)
            .field("checks", &self.checks)
            .field("forward_events", &self.forward_events)
            .field("forward_logs", &self.forward_logs)
            .field("slow_stop", &self.slow_stop)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`DaemonSpec`].
#[derive(Debug, Clone)]
pub struct DaemonSpecBuilder {
    spec: DaemonSpec,
}

impl DaemonSpecBuilder {
    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets one environment variable for the daemon.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.insert(key.into(), value.into());
        self
    }

    /// Removes a variable inherited from the host environment.
    #[must_use]
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.spec.env_remove.push(key.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spec.cwd = Some(dir.into());
        self
    }

    /// Adds a readiness check. All checks must pass before the daemon is ready.
    #[must_use]
    pub fn readiness(mut self, check: ReadinessCheck) -> Self {
        self.spec.checks.push(check);
        self
    }

    /// Wires the daemon to the session's event channel.
    #[must_use]
    pub const fn forward_events(mut self, enabled: bool) -> Self {
        self.spec.forward_events = enabled;
        self
    }

    /// Wires the daemon to the session's log channel.
    #[must_use]
    pub const fn forward_logs(mut self, enabled: bool) -> Self {
        self.spec.forward_logs = enabled;
        self
    }

    /// Prefix the daemon prepends to forwarded messages.
    #[must_use]
    pub fn log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.spec.log_prefix = Some(prefix.into());
        self
    }

    /// Overrides the session's spawn budget.
    #[must_use]
    pub const fn start_timeout(mut self, timeout: Duration) -> Self {
        self.spec.start_timeout = Some(timeout);
        self
    }

    /// Overrides the session's stop grace period.
    #[must_use]
    pub const fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.spec.stop_grace_period = Some(grace);
        self
    }

    /// Overrides the session's attempt count.
    #[must_use]
    pub const fn max_start_attempts(mut self, attempts: u32) -> Self {
        self.spec.max_start_attempts = Some(attempts);
        self
    }

    /// Chooses between graceful-then-forced termination (`true`, the default)
    /// and an immediate forced kill.
    #[must_use]
    pub const fn slow_stop(mut self, enabled: bool) -> Self {
        self.spec.slow_stop = enabled;
        self
    }

    /// Registers a lifecycle hook.
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.spec.hooks.push(hook);
        self
    }

    /// Validates and freezes the spec.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError`] describing the first invalid field.
    pub fn build(self) -> Result<DaemonSpec, SpecError> {
        let spec = self.spec;
        validate_id(&spec.id)?;
        if spec.program.as_os_str().is_empty() {
            return Err(SpecError::EmptyProgram { id: spec.id });
        }
        if let Some(key) = spec.env.keys().find(|key| !is_valid_env_key(key)) {
            return Err(SpecError::InvalidEnvKey {
                id: spec.id.clone(),
                key: key.clone(),
            });
        }
        if let Some(key) = spec
            .env
            .keys()
            .find(|key| key.starts_with(RESERVED_ENV_PREFIX))
        {
            return Err(SpecError::ReservedEnvKey {
                id: spec.id.clone(),
                key: key.clone(),
            });
        }
        for (field, value) in [
            ("start_timeout", spec.start_timeout),
            ("stop_grace_period", spec.stop_grace_period),
        ] {
            if value.is_some_and(|duration| duration.is_zero()) {
                return Err(SpecError::ZeroDuration { id: spec.id, field });
            }
        }
        if spec.max_start_attempts == Some(0) {
            return Err(SpecError::ZeroAttempts { id: spec.id });
        }
        if let Some(dir) = &spec.cwd
            && !dir.is_dir()
        {
            return Err(SpecError::MissingWorkingDirectory {
                id: spec.id.clone(),
                path: dir.clone(),
            });
        }
        Ok(spec)
    }
}

fn validate_id(id: &str) -> Result<(), SpecError> {
    if id.is_empty() {
        return Err(SpecError::EmptyId);
    }
    let valid = id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SpecError::InvalidId { id: id.to_owned() })
    }
}

fn is_valid_env_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(['=', '\0'])
}

/// Validation failures raised by [`DaemonSpecBuilder::build`].
#[derive(Debug, Error)]
pub enum SpecError {
    /// The id was empty.
    #[error("daemon id must not be empty")]
    EmptyId,
    /// The id contained characters outside `[A-Za-z0-9._-]`.
    #[error("daemon id '{id}' may only contain ASCII letters, digits, '.', '_' and '-'")]
    InvalidId {
        /// Daemon identifier.
        id: String,
    },
    /// The program path was empty.
    #[error("daemon '{id}' has no program")]
    EmptyProgram {
        /// Daemon identifier.
        id: String,
    },
    /// An environment key was empty or contained `=`.
    #[error("daemon '{id}' has invalid environment key '{key}'")]
    InvalidEnvKey {
        /// Daemon identifier.
        id: String,
        /// Variable or setting that was rejected.
        key: String,
    },
    /// An environment key used the prefix reserved for injected wiring.
    #[error("daemon '{id}' may not set reserved environment key '{key}'")]
    ReservedEnvKey {
        /// Daemon identifier.
        id: String,
        /// Variable or setting that was rejected.
        key: String,
    },
    /// A duration override was zero.
    #[error("daemon '{id}' has a zero {field}")]
    ZeroDuration {
        /// Daemon identifier.
        id: String,
        /// Setting that was zero.
        field: &'static str,
    },
    /// The attempt override was zero.
    #[error("daemon '{id}' needs at least one start attempt")]
    ZeroAttempts {
        /// Daemon identifier.
        id: String,
    },
    /// The working directory does not exist.
    #[error("daemon '{id}' working directory '{}' does not exist", path.display())]
    MissingWorkingDirectory {
        /// Daemon identifier.
        id: String,
        /// Offending path.
        path: PathBuf,
    },
}
