//! Background accept loop for channel endpoints.

use std::io;
use std::net::{TcpListener, ToSocketAddrs};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use corral_config::Endpoint;

use super::{ConnectionHandler, ConnectionRegistry, ConnectionStream, LISTENER_TARGET, ListenerError};

#[cfg(unix)]
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::Path;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Listener bound to an endpoint, not yet accepting.
#[derive(Debug)]
pub(crate) struct SocketListener {
    endpoint: Endpoint,
    listener: ListenerKind,
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl SocketListener {
    pub(crate) fn bind(endpoint: &Endpoint) -> Result<Self, ListenerError> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = bind_tcp(host, *port)?;
                let bound = listener
                    .local_addr()
                    .map_err(|source| ListenerError::LocalAddr { source })?;
                Ok(Self {
                    endpoint: endpoint.with_port(bound.port()),
                    listener: ListenerKind::Tcp(listener),
                })
            }
            Endpoint::Unix { path } => {
                #[cfg(unix)]
                {
                    endpoint.prepare_filesystem()?;
                    let listener = bind_unix(path.as_std_path())?;
                    Ok(Self {
                        endpoint: endpoint.clone(),
                        listener: ListenerKind::Unix(listener),
                    })
                }

                #[cfg(not(unix))]
                {
                    let _ = path;
                    Err(ListenerError::UnsupportedUnix {
                        endpoint: endpoint.to_string(),
                    })
                }
            }
        }
    }

    /// Endpoint daemons should connect to. Ephemeral TCP ports are resolved.
    pub(crate) const fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn start(
        self,
        role: &'static str,
        handler: Arc<dyn ConnectionHandler>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<ListenerHandle, ListenerError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        if let Err(error) = match &self.listener {
            ListenerKind::Tcp(listener) => listener.set_nonblocking(true),
            #[cfg(unix)]
            ListenerKind::Unix(listener) => listener.set_nonblocking(true),
        } {
            #[cfg(unix)]
            cleanup_unix_socket(&self.endpoint);
            return Err(ListenerError::NonBlocking { source: error });
        }
        let shutdown_flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(format!("corral-{role}-accept"))
            .spawn(move || run_accept_loop(&self, role, &shutdown_flag, &handler, &registry))
            .map_err(|source| ListenerError::Spawn { role, source })?;
        Ok(ListenerHandle {
            role,
            shutdown,
            handle: Some(handle),
        })
    }
}

/// Handle to the background accept thread.
pub(crate) struct ListenerHandle {
    role: &'static str,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ListenerHandle {
    /// Stops accepting and waits until every connection has drained.
    pub(crate) fn shutdown_and_join(mut self) -> Result<(), ListenerError> {
        self.shutdown.store(true, Ordering::SeqCst);
        let role = self.role;
        self.handle.take().map_or(Ok(()), |handle| {
            handle
                .join()
                .map_err(|_| ListenerError::ThreadPanic { role })
        })
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn run_accept_loop(
    listener: &SocketListener,
    role: &'static str,
    shutdown: &Arc<AtomicBool>,
    handler: &Arc<dyn ConnectionHandler>,
    registry: &Arc<ConnectionRegistry>,
) {
    info!(
        target: LISTENER_TARGET,
        role,
        endpoint = %listener.endpoint,
        "channel listener active"
    );
    let mut connections: Vec<thread::JoinHandle<()>> = Vec::new();
    let mut last_error = None::<io::ErrorKind>;
    while !shutdown.load(Ordering::SeqCst) {
        match accept_connection(listener) {
            Ok(Some(stream)) => {
                last_error = None;
                connections.retain(|connection| !connection.is_finished());
                let guard = registry.register(&stream);
                let connection_handler = Arc::clone(handler);
                let connection_shutdown = Arc::clone(shutdown);
                let spawned = thread::Builder::new()
                    .name(format!("corral-{role}-conn"))
                    .spawn(move || connection_handler.handle(stream, guard, &connection_shutdown));
                match spawned {
                    Ok(connection) => connections.push(connection),
                    Err(error) => warn!(
                        target: LISTENER_TARGET,
                        role,
                        error = %error,
                        "failed to spawn connection thread"
                    ),
                }
            }
            Ok(None) => thread::sleep(ACCEPT_BACKOFF),
            Err(error) => {
                let kind = error.kind();
                if last_error != Some(kind) {
                    warn!(
                        target: LISTENER_TARGET,
                        role,
                        error = %error,
                        "socket accept error"
                    );
                }
                last_error = Some(kind);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    debug!(
        target: LISTENER_TARGET,
        role,
        open = connections.len(),
        "draining connections"
    );
    for connection in connections {
        if connection.join().is_err() {
            warn!(target: LISTENER_TARGET, role, "connection thread panicked");
        }
    }

    #[cfg(unix)]
    cleanup_unix_socket(&listener.endpoint);
    info!(target: LISTENER_TARGET, role, "channel listener stopped");
}

fn accept_connection(listener: &SocketListener) -> Result<Option<ConnectionStream>, io::Error> {
    match &listener.listener {
        ListenerKind::Tcp(tcp) => match tcp.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(ConnectionStream::Tcp(stream)))
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        },
        #[cfg(unix)]
        ListenerKind::Unix(unix) => match unix.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(ConnectionStream::Unix(stream)))
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        },
    }
}

fn bind_tcp(host: &str, port: u16) -> Result<TcpListener, ListenerError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ListenerError::Resolve {
            host: host.to_owned(),
            port,
            source,
        })?;
    let addr = addrs.next().ok_or_else(|| ListenerError::ResolveEmpty {
        host: host.to_owned(),
        port,
    })?;
    TcpListener::bind(addr).map_err(|source| ListenerError::BindTcp { addr, source })
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<UnixListener, ListenerError> {
    if path.exists() {
        let metadata =
            fs::symlink_metadata(path).map_err(|source| ListenerError::UnixMetadata {
                path: path.display().to_string(),
                source,
            })?;
        if !metadata.file_type().is_socket() {
            return Err(ListenerError::UnixNotSocket {
                path: path.display().to_string(),
            });
        }
        match UnixStream::connect(path) {
            Ok(_stream) => {
                return Err(ListenerError::UnixInUse {
                    path: path.display().to_string(),
                });
            }
            Err(error)
                if error.kind() == io::ErrorKind::ConnectionRefused
                    || error.kind() == io::ErrorKind::NotFound =>
            {
                fs::remove_file(path).map_err(|source| ListenerError::UnixCleanup {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            Err(error) => {
                return Err(ListenerError::UnixConnect {
                    path: path.display().to_string(),
                    source: error,
                });
            }
        }
    }

    UnixListener::bind(path).map_err(|source| ListenerError::BindUnix {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(unix)]
fn cleanup_unix_socket(endpoint: &Endpoint) {
    let Endpoint::Unix { path } = endpoint else {
        return;
    };
    if let Err(error) = fs::remove_file(path.as_std_path())
        && error.kind() != io::ErrorKind::NotFound
    {
        warn!(
            target: LISTENER_TARGET,
            error = %error,
            path = %path,
            "failed to remove unix socket file"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionGuard;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    impl ConnectionHandler for CountingHandler {
        fn handle(&self, _stream: ConnectionStream, _guard: ConnectionGuard, _shutdown: &AtomicBool) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for_count(count: &AtomicUsize, expected: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if count.load(Ordering::SeqCst) >= expected {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn ephemeral_tcp_port_is_resolved() {
        let listener = SocketListener::bind(&Endpoint::loopback(0)).expect("bind tcp listener");
        let port = listener.local_endpoint().tcp_port().expect("tcp port");
        assert_ne!(port, 0);
    }

    #[test]
    fn tcp_listener_accepts_connections() {
        let listener = SocketListener::bind(&Endpoint::loopback(0)).expect("bind tcp listener");
        let port = listener.local_endpoint().tcp_port().expect("tcp port");
        let count = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler {
            count: Arc::clone(&count),
        });
        let registry = Arc::new(ConnectionRegistry::default());
        let handle = listener
            .start("test", handler, Arc::clone(&registry))
            .expect("start listener");

        let _first = TcpStream::connect(("127.0.0.1", port)).expect("connect first client");
        let _second = TcpStream::connect(("127.0.0.1", port)).expect("connect second client");

        assert!(wait_for_count(&count, 2), "expected two connections");
        handle.shutdown_and_join().expect("join listener");
        assert_eq!(registry.len(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn unix_listener_cleans_stale_socket_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("events.sock");
        {
            let _stale = UnixListener::bind(&path).expect("bind stale listener");
        }
        assert!(path.exists(), "stale socket should remain");

        let endpoint = Endpoint::unix(path.to_str().expect("utf8 path").to_owned());
        let listener = SocketListener::bind(&endpoint).expect("bind new listener");
        let count = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler {
            count: Arc::clone(&count),
        });
        let handle = listener
            .start("test", handler, Arc::new(ConnectionRegistry::default()))
            .expect("start listener");

        UnixStream::connect(&path).expect("connect unix client");
        assert!(wait_for_count(&count, 1));

        handle.shutdown_and_join().expect("join listener");
        assert!(
            !path.exists(),
            "listener should remove unix socket on shutdown"
        );
    }

    #[cfg(unix)]
    #[test]
    fn unix_listener_rejects_in_use_socket() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("logs.sock");
        let _existing = UnixListener::bind(&path).expect("bind existing listener");

        let endpoint = Endpoint::unix(path.to_str().expect("utf8 path").to_owned());
        let error = SocketListener::bind(&endpoint).expect_err("should fail bind");
        assert!(matches!(error, ListenerError::UnixInUse { .. }));
    }
}
