//! Accepts daemon log channels and forwards records into a [`LogSink`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use corral_config::Endpoint;
use corral_wire::{LogFrame, decode};
use tracing::{debug, info, warn};

use super::{LOGS_TARGET, LogRecord, LogSink};
use crate::transport::{
    ConnectionGuard, ConnectionHandler, ConnectionRegistry, ConnectionStream, FrameItem, ListenerError,
    ListenerHandle, Served, SocketListener, serve_frames,
};

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    forwarded: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
}

/// Session-wide log collection server.
///
/// Runs independently of any daemon's lifecycle until [`LogServer::shutdown`].
/// A connection that fails is logged once and does not affect the others.
pub struct LogServer {
    endpoint: Endpoint,
    counters: Arc<Counters>,
    registry: Arc<ConnectionRegistry>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl LogServer {
    /// Binds `endpoint` and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint cannot be bound or the accept
    /// thread cannot be spawned.
    pub fn start(endpoint: &Endpoint, sink: Arc<dyn LogSink>) -> Result<Self, ListenerError> {
        let listener = SocketListener::bind(endpoint)?;
        let bound = listener.local_endpoint().clone();
        let counters = Arc::new(Counters::default());
        let registry = Arc::new(ConnectionRegistry::default());
        let handler = Arc::new(LogConnectionHandler {
            sink,
            counters: Arc::clone(&counters),
        });
        let handle = listener.start("logs", handler, Arc::clone(&registry))?;
        info!(target: LOGS_TARGET, endpoint = %bound, "log server started");
        Ok(Self {
            endpoint: bound,
            counters,
            registry,
            listener: Mutex::new(Some(handle)),
        })
    }

    /// Endpoint daemons forward to, with any ephemeral port resolved.
    #[must_use]
    pub const fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of connections accepted so far.
    #[must_use]
    pub fn accepted_connections(&self) -> u64 {
        self.counters.accepted.load(Ordering::Relaxed)
    }

    /// Number of records delivered to the sink.
    #[must_use]
    pub fn forwarded_records(&self) -> u64 {
        self.counters.forwarded.load(Ordering::Relaxed)
    }

    /// Number of frames dropped because they were oversized or undecodable.
    #[must_use]
    pub fn malformed_frames(&self) -> u64 {
        self.counters.malformed.load(Ordering::Relaxed)
    }

    /// Number of connections that ended with a read error.
    #[must_use]
    pub fn dropped_connections(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Number of open daemon connections.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.registry.len()
    }

    /// Closes `daemon_id`'s connections, giving them `drain` to finish.
    pub fn detach(&self, daemon_id: &str, drain: Duration) -> usize {
        self.registry.detach(daemon_id, drain)
    }

    /// Stops accepting, drains buffered records into the sink, then closes.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if let Err(error) = handle.shutdown_and_join() {
            warn!(target: LOGS_TARGET, error = %error, "log server did not stop cleanly");
        }
        info!(
            target: LOGS_TARGET,
            forwarded = self.forwarded_records(),
            malformed = self.malformed_frames(),
            dropped = self.dropped_connections(),
            "log server stopped"
        );
    }
}

impl Drop for LogServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct LogConnectionHandler {
    sink: Arc<dyn LogSink>,
    counters: Arc<Counters>,
}

impl LogConnectionHandler {
    fn forward(&self, frame: LogFrame) {
        let timestamp = if frame.timestamp_ms == 0 {
            SystemTime::now()
        } else {
            UNIX_EPOCH + Duration::from_millis(frame.timestamp_ms)
        };
        let record = LogRecord {
            daemon_id: frame.daemon_id,
            level: frame.level,
            logger: frame.logger,
            message: frame.message,
            timestamp,
        };
        self.sink.emit(&record);
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
    }
}

impl ConnectionHandler for LogConnectionHandler {
    fn handle(&self, stream: ConnectionStream, guard: ConnectionGuard, shutdown: &AtomicBool) {
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        let peer = stream.to_string();
        let mut origin: Option<String> = None;
        let served = serve_frames(stream, shutdown, |item| {
            let FrameItem::Frame(bytes) = item else {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(target: LOGS_TARGET, peer = %peer, "oversized log frame dropped");
                return;
            };
            match decode::<LogFrame>(&bytes) {
                Ok(frame) => {
                    if origin.is_none() {
                        guard.attribute(&frame.daemon_id);
                        origin = Some(frame.daemon_id.clone());
                    }
                    self.forward(frame);
                }
                Err(error) => {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        target: LOGS_TARGET,
                        peer = %peer,
                        error = %error,
                        "malformed log frame dropped"
                    );
                }
            }
        });
        let daemon_id = origin.as_deref().unwrap_or("<unattributed>");
        match served {
            Served::Closed | Served::Shutdown => {
                debug!(target: LOGS_TARGET, daemon_id, peer = %peer, "log channel closed");
            }
            Served::Failed(error) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: LOGS_TARGET,
                    daemon_id,
                    peer = %peer,
                    error = %error,
                    "log channel dropped"
                );
            }
        }
    }
}
