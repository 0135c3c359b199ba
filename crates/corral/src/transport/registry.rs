//! Tracks open connections and which daemon each belongs to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{ConnectionStream, LISTENER_TARGET};

const DETACH_POLL: Duration = Duration::from_millis(10);

struct Entry {
    daemon_id: Option<String>,
    control: Option<ConnectionStream>,
}

/// Connection set for one listener, guarded independently of everything else.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl ConnectionRegistry {
    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a freshly accepted connection.
    pub(crate) fn register(self: &Arc<Self>, stream: &ConnectionStream) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let control = stream
            .try_clone()
            .inspect_err(|error| {
                warn!(
                    target: LISTENER_TARGET,
                    error = %error,
                    "connection cannot be force-closed on detach"
                );
            })
            .ok();
        self.entries().insert(
            id,
            Entry {
                daemon_id: None,
                control,
            },
        );
        ConnectionGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Number of open connections.
    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }

    /// Number of open connections attributed to `daemon_id`.
    pub(crate) fn count_for(&self, daemon_id: &str) -> usize {
        self.entries()
            .values()
            .filter(|entry| entry.daemon_id.as_deref() == Some(daemon_id))
            .count()
    }

    /// Waits up to `drain` for `daemon_id`'s connections to close on their
    /// own, then shuts down any that remain. Returns how many were forced.
    pub(crate) fn detach(&self, daemon_id: &str, drain: Duration) -> usize {
        let deadline = crate::deadline::after(drain);
        while self.count_for(daemon_id) > 0 && Instant::now() < deadline {
            thread::sleep(DETACH_POLL);
        }
        let entries = self.entries();
        let mut forced = 0;
        for entry in entries
            .values()
            .filter(|entry| entry.daemon_id.as_deref() == Some(daemon_id))
        {
            if let Some(control) = &entry.control
                && control.shutdown().is_ok()
            {
                forced += 1;
            }
        }
        if forced > 0 {
            debug!(
                target: LISTENER_TARGET,
                daemon_id,
                forced,
                "closed lingering connections"
            );
        }
        forced
    }

    fn attribute(&self, id: u64, daemon_id: &str) {
        if let Some(entry) = self.entries().get_mut(&id)
            && entry.daemon_id.is_none()
        {
            entry.daemon_id = Some(daemon_id.to_owned());
        }
    }

    fn remove(&self, id: u64) {
        self.entries().remove(&id);
    }
}

/// Removes its connection from the registry when dropped.
pub(crate) struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: u64,
}

impl ConnectionGuard {
    /// Associates the connection with the daemon named in its first frame.
    pub(crate) fn attribute(&self, daemon_id: &str) {
        self.registry.attribute(self.id, daemon_id);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    fn server_stream() -> (TcpStream, ConnectionStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, ConnectionStream::Tcp(server))
    }

    #[test]
    fn guards_deregister_on_drop() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (_client, stream) = server_stream();
        let guard = registry.register(&stream);
        guard.attribute("d1");
        assert_eq!(registry.count_for("d1"), 1);
        drop(guard);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn detach_force_closes_lingering_connections() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (mut client, stream) = server_stream();
        let guard = registry.register(&stream);
        guard.attribute("d1");

        let forced = registry.detach("d1", Duration::from_millis(30));
        assert_eq!(forced, 1);

        let mut buf = [0_u8; 8];
        let read = client.read(&mut buf).expect("read after shutdown");
        assert_eq!(read, 0, "peer should observe EOF");
        drop(guard);
    }

    #[test]
    fn detach_ignores_other_daemons() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (_client, stream) = server_stream();
        let guard = registry.register(&stream);
        guard.attribute("d2");
        assert_eq!(registry.detach("d1", Duration::ZERO), 0);
        assert_eq!(registry.count_for("d2"), 1);
        drop(guard);
    }

    #[test]
    fn unbounded_detach_returns_once_connections_close() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (_client, stream) = server_stream();
        let guard = registry.register(&stream);
        guard.attribute("d1");
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            drop(guard);
        });
        assert_eq!(registry.detach("d1", Duration::MAX), 0);
        closer.join().expect("join closer");
    }
}
