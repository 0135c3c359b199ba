//! Termination signals delivered to a daemon's process group.

use std::io;

/// Signals the supervisor sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopSignal {
    /// Ask the daemon to shut down.
    Graceful,
    /// Kill the daemon outright.
    Forced,
}

impl StopSignal {
    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Graceful => "SIGTERM",
            Self::Forced => "SIGKILL",
        }
    }
}

/// Outcome of a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    /// No process in the group remains.
    Gone,
}

/// Sends `signal` to every process in the group led by `pid`.
///
/// Daemons are launched as group leaders, so the group id equals the pid.
/// Falls back to signalling the pid alone when the group is gone but the
/// leader is not (it may have moved itself to another group). Only call this
/// while the child is unreaped, so the pid cannot have been recycled.
#[cfg(unix)]
pub(crate) fn send(pid: u32, signal: StopSignal) -> io::Result<Delivery> {
    match send_group(pid, signal)? {
        Delivery::Sent => Ok(Delivery::Sent),
        Delivery::Gone => send_leader(pid, signal),
    }
}

/// Sends `signal` to the group led by `pid` and never to the pid alone.
///
/// Safe after the leader has been reaped: a recycled pid outside the group
/// is left untouched.
#[cfg(unix)]
pub(crate) fn send_group(pid: u32, signal: StopSignal) -> io::Result<Delivery> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;

    match killpg(target(pid)?, raw_signal(signal)) {
        Ok(()) => Ok(Delivery::Sent),
        Err(Errno::ESRCH) => Ok(Delivery::Gone),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(unix)]
fn send_leader(pid: u32, signal: StopSignal) -> io::Result<Delivery> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    match kill(target(pid)?, raw_signal(signal)) {
        Ok(()) => Ok(Delivery::Sent),
        Err(Errno::ESRCH) => Ok(Delivery::Gone),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(unix)]
fn target(pid: u32) -> io::Result<nix::unistd::Pid> {
    i32::try_from(pid)
        .map(nix::unistd::Pid::from_raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))
}

#[cfg(unix)]
const fn raw_signal(signal: StopSignal) -> nix::sys::signal::Signal {
    match signal {
        StopSignal::Graceful => nix::sys::signal::Signal::SIGTERM,
        StopSignal::Forced => nix::sys::signal::Signal::SIGKILL,
    }
}

/// Reports whether a process with `pid` exists.
#[cfg(all(test, unix))]
pub(crate) fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub(crate) fn send(_pid: u32, _signal: StopSignal) -> io::Result<Delivery> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process group signals are unsupported on this platform",
    ))
}

#[cfg(not(unix))]
pub(crate) fn send_group(_pid: u32, _signal: StopSignal) -> io::Result<Delivery> {
    Ok(Delivery::Gone)
}

#[cfg(all(test, not(unix)))]
pub(crate) fn process_exists(_pid: u32) -> bool {
    false
}
