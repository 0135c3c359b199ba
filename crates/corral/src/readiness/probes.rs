//! Built-in probes: socket connectivity, pid files, and observed events.

use std::fs;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use corral_config::Endpoint;
#[cfg(unix)]
use socket2::{Domain, SockAddr, Socket, Type};

use super::{ProbeContext, ProbeOutcome};
use crate::events::TagPattern;

/// `connect_timeout` rejects a zero duration.
const MIN_CONNECT_BUDGET: Duration = Duration::from_millis(1);

pub(super) fn port_open(endpoint: &Endpoint, budget: Duration) -> ProbeOutcome {
    match try_connect(endpoint, budget.max(MIN_CONNECT_BUDGET)) {
        Ok(()) => ProbeOutcome::Ready,
        Err(error) if is_not_listening(&error) => {
            ProbeOutcome::pending(format_args!("not listening: {error}"))
        }
        Err(error) => ProbeOutcome::pending(format_args!("probe failed: {error}")),
    }
}

fn try_connect(endpoint: &Endpoint, budget: Duration) -> io::Result<()> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let address = resolve_tcp(host, *port)?;
            TcpStream::connect_timeout(&address, budget).map(|_| ())
        }
        Endpoint::Unix { path } => connect_unix(path.as_std_path(), budget),
    }
}

fn resolve_tcp(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved address"))
}

#[cfg(unix)]
fn connect_unix(path: &Path, budget: Duration) -> io::Result<()> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    let address = SockAddr::unix(path)?;
    socket.connect_timeout(&address, budget)
}

#[cfg(not(unix))]
fn connect_unix(_path: &Path, _budget: Duration) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix sockets unsupported on this platform",
    ))
}

/// Errors meaning nothing accepts connections at the address yet.
///
/// `ConnectionReset` is excluded: a peer accepted and then closed, so
/// something is listening.
fn is_not_listening(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotFound
            | io::ErrorKind::AddrNotAvailable
    )
}

pub(super) fn pid_file(path: &Path) -> ProbeOutcome {
    match fs::read_to_string(path) {
        Ok(contents) => match contents.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => ProbeOutcome::Ready,
            _ if contents.trim().is_empty() => ProbeOutcome::pending("pid file is empty"),
            _ => ProbeOutcome::pending(format_args!(
                "pid file holds '{}', not a process id",
                contents.trim()
            )),
        },
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            ProbeOutcome::pending("pid file does not exist")
        }
        Err(error) => ProbeOutcome::pending(format_args!("reading pid file failed: {error}")),
    }
}

pub(super) fn event_seen(pattern: &TagPattern, context: &ProbeContext<'_>) -> ProbeOutcome {
    let Some(events) = context.events() else {
        return ProbeOutcome::pending("no event listener attached");
    };
    let seen = events.events_since(pattern, context.started_at(), Some(context.daemon_id()));
    if seen.is_empty() {
        ProbeOutcome::pending(format_args!("no event matching '{pattern}' yet"))
    } else {
        ProbeOutcome::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::TcpListener;
    use std::thread;
    use std::time::SystemTime;

    use crate::events::EventListener;

    const BUDGET: Duration = Duration::from_millis(500);

    #[test]
    fn port_probe_tracks_tcp_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        let endpoint = Endpoint::loopback(port);
        assert_eq!(port_open(&endpoint, BUDGET), ProbeOutcome::Ready);
        drop(listener);
        thread::sleep(Duration::from_millis(50));
        let outcome = port_open(&endpoint, BUDGET);
        assert!(
            matches!(&outcome, ProbeOutcome::Pending(text) if text.starts_with("not listening")),
            "unexpected outcome {outcome:?}"
        );
    }

    #[test]
    fn zero_budget_is_clamped() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        let outcome = port_open(&Endpoint::loopback(port), Duration::ZERO);
        assert!(
            !matches!(&outcome, ProbeOutcome::Pending(text) if text.contains("zero")),
            "zero budget reached connect_timeout: {outcome:?}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn port_probe_tracks_unix_listener() {
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = dir.path().join("probe.sock");
        let endpoint = Endpoint::unix(socket_path.to_str().expect("utf-8 path"));
        assert!(matches!(port_open(&endpoint, BUDGET), ProbeOutcome::Pending(_)));

        let listener = UnixListener::bind(&socket_path).expect("bind unix listener");
        assert_eq!(port_open(&endpoint, BUDGET), ProbeOutcome::Ready);
        drop(listener);
    }

    #[rstest]
    #[case::connection_refused(io::ErrorKind::ConnectionRefused, true)]
    #[case::not_found(io::ErrorKind::NotFound, true)]
    #[case::addr_not_available(io::ErrorKind::AddrNotAvailable, true)]
    #[case::permission_denied(io::ErrorKind::PermissionDenied, false)]
    #[case::timed_out(io::ErrorKind::TimedOut, false)]
    #[case::connection_reset(io::ErrorKind::ConnectionReset, false)]
    fn classifies_not_listening_errors(#[case] kind: io::ErrorKind, #[case] expected: bool) {
        assert_eq!(is_not_listening(&io::Error::new(kind, "probe")), expected);
    }

    #[rstest]
    #[case::missing(None, false)]
    #[case::empty(Some(""), false)]
    #[case::garbage(Some("salt"), false)]
    #[case::zero(Some("0\n"), false)]
    #[case::valid(Some("4242\n"), true)]
    fn pid_file_needs_a_process_id(#[case] contents: Option<&str>, #[case] ready: bool) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("daemon.pid");
        if let Some(text) = contents {
            fs::write(&path, text).expect("write pid file");
        }
        assert_eq!(pid_file(&path) == ProbeOutcome::Ready, ready);
    }

    #[test]
    fn event_probe_needs_a_listener() {
        let context = ProbeContext::new("d1", Some(1), SystemTime::now());
        assert_eq!(
            event_seen(&TagPattern::exact("ready"), &context),
            ProbeOutcome::Pending("no event listener attached".to_owned())
        );
    }

    #[test]
    fn event_probe_ignores_events_before_launch() {
        use corral_wire::EventPublisher;

        let listener =
            EventListener::start(&Endpoint::loopback(0), Duration::from_secs(60)).expect("listener");
        let publisher = EventPublisher::connect(listener.local_endpoint(), "d1").expect("connect");
        let subscription = listener.subscribe("ready");
        publisher
            .publish("ready", serde_json::Value::Null)
            .expect("publish");
        listener
            .wait_for(&subscription, Duration::from_secs(5))
            .expect("first event");

        let launched = SystemTime::now();
        let context = ProbeContext::new("d1", Some(1), launched).with_events(&listener);
        assert!(matches!(
            event_seen(&TagPattern::exact("ready"), &context),
            ProbeOutcome::Pending(_)
        ));

        publisher
            .publish("ready", serde_json::Value::Null)
            .expect("publish");
        listener
            .wait_for(&subscription, Duration::from_secs(5))
            .expect("second event");
        assert_eq!(event_seen(&TagPattern::exact("ready"), &context), ProbeOutcome::Ready);
        listener.shutdown();
    }
}
