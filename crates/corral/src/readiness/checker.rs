//! Fixed-interval readiness polling.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::{DEFAULT_PROBE_TIMEOUT, ProbeContext, ProbeOutcome, READINESS_TARGET, ReadinessCheck};
use crate::error::{ExitSummary, ReadinessTimeoutError};
use crate::process::{ProcessState, Supervisor};

/// Lets the poller notice a process that died while it was waiting.
pub trait ProcessWatch {
    /// Exit status when the process has already ended.
    fn exit_status(&self) -> Option<ExitSummary>;

    /// Current lifecycle state.
    fn state(&self) -> ProcessState;
}

impl ProcessWatch for Supervisor {
    fn exit_status(&self) -> Option<ExitSummary> {
        self.poll_exit()
    }

    fn state(&self) -> ProcessState {
        Self::state(self)
    }
}

/// Successful readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessReport {
    /// Time from the first poll until every check had passed.
    pub elapsed: Duration,
    /// Number of polling rounds.
    pub polls: u32,
}

/// Why a readiness wait ended without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessFailure {
    /// The budget ran out with checks still pending.
    TimedOut(ReadinessTimeoutError),
    /// The process exited first.
    Exited(ExitSummary),
}

/// Polls readiness checks at a fixed interval until all pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessChecker {
    poll_interval: Duration,
}

struct Pending<'a> {
    check: &'a ReadinessCheck,
    observation: String,
}

impl ReadinessChecker {
    /// Builds a checker that sleeps `poll_interval` between rounds.
    #[must_use]
    pub const fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Sleep between polling rounds.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Waits until every check in `checks` has succeeded once.
    ///
    /// Each round first asks `watch` whether the process has exited, then
    /// probes the checks still pending. A check that passes is not probed
    /// again. Every check runs at least once, even with a zero `timeout`,
    /// and no probe is granted more time than the budget has left.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessFailure::Exited`] if the process ends first and
    /// [`ReadinessFailure::TimedOut`] when `timeout` elapses with checks still
    /// pending. The timeout error reports a single attempt; callers that retry
    /// overwrite the count.
    pub fn await_ready(
        &self,
        checks: &[ReadinessCheck],
        timeout: Duration,
        context: &ProbeContext<'_>,
        watch: &dyn ProcessWatch,
    ) -> Result<ReadinessReport, ReadinessFailure> {
        let started = Instant::now();
        let deadline = crate::deadline::after_from(started, timeout);
        let mut pending: Vec<Pending<'_>> = checks
            .iter()
            .map(|check| Pending {
                check,
                observation: "not yet probed".to_owned(),
            })
            .collect();
        let mut polls: u32 = 0;

        loop {
            polls = polls.saturating_add(1);
            if let Some(exit) = watch.exit_status() {
                debug!(
                    target: READINESS_TARGET,
                    daemon_id = context.daemon_id(),
                    status = %exit,
                    "process exited before it became ready"
                );
                return Err(ReadinessFailure::Exited(exit));
            }

            pending.retain_mut(|entry| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let budget = entry
                    .check
                    .probe_timeout()
                    .unwrap_or(DEFAULT_PROBE_TIMEOUT)
                    .min(remaining);
                match entry.check.evaluate(context, budget) {
                    ProbeOutcome::Ready => {
                        debug!(
                            target: READINESS_TARGET,
                            daemon_id = context.daemon_id(),
                            check = entry.check.label(),
                            "readiness check passed"
                        );
                        false
                    }
                    ProbeOutcome::Pending(observation) => {
                        trace!(
                            target: READINESS_TARGET,
                            daemon_id = context.daemon_id(),
                            check = entry.check.label(),
                            observation = %observation,
                            "readiness check pending"
                        );
                        entry.observation = observation;
                        true
                    }
                }
            });

            if pending.is_empty() {
                return Ok(ReadinessReport {
                    elapsed: started.elapsed(),
                    polls,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ReadinessFailure::TimedOut(ReadinessTimeoutError {
                    daemon_id: context.daemon_id().to_owned(),
                    pid: context.pid(),
                    timeout,
                    pending: pending
                        .iter()
                        .map(|entry| entry.check.label().to_owned())
                        .collect(),
                    observations: pending
                        .into_iter()
                        .map(|entry| (entry.check.label().to_owned(), entry.observation))
                        .collect(),
                    last_state: watch.state(),
                    attempts: 1,
                }));
            }
            thread::sleep(self.poll_interval.min(deadline.saturating_duration_since(now)));
        }
    }
}
