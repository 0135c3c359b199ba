//! Connection handling abstractions for channel listeners.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use corral_wire::{FrameReader, ReadOutcome};
use tracing::debug;

use super::{ConnectionGuard, ConnectionStream, LISTENER_TARGET};

/// Read timeout used so readers notice shutdown promptly.
const READ_POLL: Duration = Duration::from_millis(50);
/// Longest a reader keeps draining a busy connection after shutdown.
const DRAIN_BUDGET: Duration = Duration::from_secs(2);

/// Handles accepted socket connections.
pub(crate) trait ConnectionHandler: Send + Sync + 'static {
    /// Serves one connection until it closes or `shutdown` is raised.
    /// Implementations should avoid panicking.
    fn handle(&self, stream: ConnectionStream, guard: ConnectionGuard, shutdown: &AtomicBool);
}

/// One unit read off a connection.
#[derive(Debug)]
pub(crate) enum FrameItem {
    Frame(Vec<u8>),
    Oversized,
}

/// Why [`serve_frames`] returned.
#[derive(Debug)]
pub(crate) enum Served {
    /// The peer closed the connection.
    Closed,
    /// The listener shut down and buffered data was drained.
    Shutdown,
    /// The connection failed.
    Failed(io::Error),
}

/// Reads frames from `stream` and passes them to `on_frame` in arrival order.
///
/// After `shutdown` is raised the reader keeps going until the peer goes
/// quiet, so frames already sent are not lost, but never for longer than
/// the drain budget.
pub(crate) fn serve_frames<F>(stream: ConnectionStream, shutdown: &AtomicBool, mut on_frame: F) -> Served
where
    F: FnMut(FrameItem),
{
    if let Err(error) = stream.set_read_timeout(Some(READ_POLL)) {
        return Served::Failed(error);
    }
    let mut reader = FrameReader::new(stream);
    let mut shutdown_seen: Option<Instant> = None;
    loop {
        if shutdown_seen.is_none() && shutdown.load(Ordering::SeqCst) {
            shutdown_seen = Some(Instant::now());
        }
        if shutdown_seen.is_some_and(|seen| seen.elapsed() > DRAIN_BUDGET) {
            debug!(
                target: LISTENER_TARGET,
                peer = %reader.get_ref(),
                "drain budget exhausted"
            );
            return Served::Shutdown;
        }
        match reader.next_frame() {
            Ok(ReadOutcome::Frame(frame)) => on_frame(FrameItem::Frame(frame)),
            Ok(ReadOutcome::Oversized) => on_frame(FrameItem::Oversized),
            Ok(ReadOutcome::Idle) => {
                if shutdown_seen.is_some() && !reader.has_partial() {
                    return Served::Shutdown;
                }
            }
            Ok(ReadOutcome::Eof) => return Served::Closed,
            Err(error) => return Served::Failed(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn connected_pair() -> (TcpStream, ConnectionStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, ConnectionStream::Tcp(server))
    }

    #[test]
    fn frames_arrive_in_order_until_close() {
        let (mut client, server) = connected_pair();
        let writer = thread::spawn(move || {
            for index in 0..20 {
                writeln!(client, "{{\"n\":{index}}}").expect("write frame");
            }
        });
        let shutdown = AtomicBool::new(false);
        let mut seen = Vec::new();
        let served = serve_frames(server, &shutdown, |item| {
            if let FrameItem::Frame(frame) = item {
                seen.push(String::from_utf8(frame).expect("utf8"));
            }
        });
        writer.join().expect("writer");
        assert!(matches!(served, Served::Closed));
        let expected: Vec<String> = (0..20).map(|index| format!("{{\"n\":{index}}}")).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn shutdown_drains_pending_frames_then_returns() {
        let (mut client, server) = connected_pair();
        client.write_all(b"{\"a\":1}\n{\"b\":2}\n").expect("write");
        let shutdown = AtomicBool::new(true);
        let mut count = 0;
        let served = serve_frames(server, &shutdown, |_| count += 1);
        assert!(matches!(served, Served::Shutdown));
        assert_eq!(count, 2);
        drop(client);
    }
}
