//! Ephemeral localhost ports for daemon configuration.
//!
//! The operating system picks the port and the probe socket is closed before
//! returning, so another process could claim it in between. Callers that need
//! several distinct ports should ask for them together.

use std::io;
use std::net::{Ipv4Addr, TcpListener};

/// Returns a TCP port on `127.0.0.1` that was free a moment ago.
///
/// # Errors
///
/// Returns the I/O error raised when binding the probe socket fails.
pub fn unused_local_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Returns `count` distinct free ports.
///
/// All probe sockets stay bound until every port is chosen, so the result
/// holds no duplicates.
///
/// # Errors
///
/// Returns the I/O error raised when binding a probe socket fails.
pub fn unused_local_ports(count: usize) -> io::Result<Vec<u16>> {
    let listeners = (0..count)
        .map(|_| TcpListener::bind((Ipv4Addr::LOCALHOST, 0)))
        .collect::<io::Result<Vec<_>>>()?;
    listeners
        .iter()
        .map(|listener| listener.local_addr().map(|addr| addr.port()))
        .collect()
}
