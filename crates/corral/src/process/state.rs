//! Daemon lifecycle states and the transitions allowed between them.

use std::fmt;

use thiserror::Error;

/// Lifecycle state of a supervised daemon.
///
/// ```text
/// Created -> Starting -> Ready -> Running -> Stopping -> Stopped
///               |                   |           |
///               +-------------------+-----------+--> Failed
/// ```
///
/// `Stopping` is reachable from `Starting`, `Ready` and `Running`; `Failed`
/// from `Starting`, `Running` and `Stopping`. `Stopped` and `Failed` are
/// terminal and no state is ever re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Supervisor built, process not launched.
    Created,
    /// Process launched, readiness not yet confirmed.
    Starting,
    /// Every readiness check has succeeded.
    Ready,
    /// Handed to the caller.
    Running,
    /// Termination in progress.
    Stopping,
    /// Process exited and was reaped.
    Stopped,
    /// Launch, readiness, or termination failed.
    Failed,
}

impl ProcessState {
    /// Reports whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Reports whether the OS process may still be alive.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Ready | Self::Running | Self::Stopping
        )
    }

    /// Reports whether moving to `next` is permitted.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Starting)
                | (Self::Starting, Self::Ready)
                | (Self::Ready, Self::Running)
                | (Self::Starting | Self::Ready | Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
                | (Self::Starting | Self::Running | Self::Stopping, Self::Failed)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        formatter.write_str(label)
    }
}

/// A requested transition is not permitted from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State the process was in.
    pub from: ProcessState,
    /// State that was requested.
    pub to: ProcessState,
}
