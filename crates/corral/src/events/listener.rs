//! Accepts daemon event channels and fans decoded frames out to subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime};

use corral_config::Endpoint;
use corral_wire::{EventFrame, decode};
use tracing::{debug, info, trace, warn};

use super::subscription::{Received, SubscriptionTable};
use super::{EVENTS_TARGET, EventRecord, Subscription, TagPattern};
use crate::error::EventTimeoutError;
use crate::transport::{
    ConnectionGuard, ConnectionHandler, ConnectionRegistry, ConnectionStream, FrameItem, ListenerError,
    ListenerHandle, Served, SocketListener, serve_frames,
};

/// Upper bound on retained history regardless of age.
const HISTORY_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
}

struct History {
    retention: Duration,
    records: VecDeque<EventRecord>,
}

impl History {
    fn push(&mut self, record: EventRecord) {
        let horizon = record.received_at.checked_sub(self.retention);
        while let Some(oldest) = self.records.front() {
            let expired = horizon.is_some_and(|cutoff| oldest.received_at < cutoff);
            if !expired && self.records.len() < HISTORY_CAPACITY {
                break;
            }
            self.records.pop_front();
        }
        self.records.push_back(record);
    }
}

struct Runtime {
    listener: ListenerHandle,
    dispatcher: thread::JoinHandle<()>,
}

/// Session-wide receiver for daemon events.
///
/// One instance multiplexes every daemon's event channel. Waiting callers
/// block on their own [`Subscription`] and never stall the receive loop.
pub struct EventListener {
    endpoint: Endpoint,
    table: Arc<SubscriptionTable>,
    history: Arc<Mutex<History>>,
    counters: Arc<Counters>,
    registry: Arc<ConnectionRegistry>,
    runtime: Mutex<Option<Runtime>>,
}

impl EventListener {
    /// Binds `endpoint` and starts the accept and dispatch threads.
    ///
    /// Events are kept for `retention` so they can be queried after the fact
    /// with [`EventListener::events_since`].
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint cannot be bound or a thread cannot
    /// be spawned.
    pub fn start(endpoint: &Endpoint, retention: Duration) -> Result<Self, ListenerError> {
        let listener = SocketListener::bind(endpoint)?;
        let bound = listener.local_endpoint().clone();
        let table = Arc::new(SubscriptionTable::default());
        let history = Arc::new(Mutex::new(History {
            retention,
            records: VecDeque::new(),
        }));
        let counters = Arc::new(Counters::default());
        let registry = Arc::new(ConnectionRegistry::default());

        let (sender, receiver) = mpsc::channel();
        let dispatcher = {
            let dispatch_table = Arc::clone(&table);
            let dispatch_history = Arc::clone(&history);
            let dispatch_counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("corral-events-dispatch".to_owned())
                .spawn(move || {
                    dispatch(&receiver, &dispatch_table, &dispatch_history, &dispatch_counters);
                })
                .map_err(|source| ListenerError::Spawn {
                    role: "event dispatch",
                    source,
                })?
        };
        let handler = Arc::new(EventConnectionHandler {
            sender,
            counters: Arc::clone(&counters),
        });
        let listener = listener.start("events", handler, Arc::clone(&registry))?;
        info!(target: EVENTS_TARGET, endpoint = %bound, "event listener started");
        Ok(Self {
            endpoint: bound,
            table,
            history,
            counters,
            registry,
            runtime: Mutex::new(Some(Runtime {
                listener,
                dispatcher,
            })),
        })
    }

    /// Endpoint daemons publish to, with any ephemeral port resolved.
    #[must_use]
    pub const fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Subscribes to events from any daemon whose tag matches `pattern`.
    pub fn subscribe(&self, pattern: impl Into<TagPattern>) -> Subscription {
        self.table.subscribe(pattern.into(), None)
    }

    /// Subscribes to events from `daemon_id` whose tag matches `pattern`.
    pub fn subscribe_to(&self, daemon_id: &str, pattern: impl Into<TagPattern>) -> Subscription {
        self.table.subscribe(pattern.into(), Some(daemon_id.to_owned()))
    }

    /// Blocks until `subscription` receives a record or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`EventTimeoutError`] when nothing matched in time or the
    /// listener shut down first.
    pub fn wait_for(
        &self,
        subscription: &Subscription,
        timeout: Duration,
    ) -> Result<EventRecord, EventTimeoutError> {
        wait_on(subscription, timeout)
    }

    /// Retained records matching `pattern` received strictly after `after`,
    /// oldest first, optionally restricted to one daemon.
    #[must_use]
    pub fn events_since(
        &self,
        pattern: &TagPattern,
        after: SystemTime,
        daemon_id: Option<&str>,
    ) -> Vec<EventRecord> {
        self.history()
            .records
            .iter()
            .filter(|record| record.received_at > after)
            .filter(|record| daemon_id.is_none_or(|origin| origin == record.daemon_id))
            .filter(|record| pattern.matches(&record.tag))
            .cloned()
            .collect()
    }

    /// Number of events decoded and dispatched.
    #[must_use]
    pub fn received_events(&self) -> u64 {
        self.counters.received.load(Ordering::Relaxed)
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

    /// Stops accepting, drains open connections, dispatches what was read,
    /// and wakes every waiter. Safe to call more than once.
    pub fn shutdown(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Runtime {
            listener,
            dispatcher,
        }) = runtime
        else {
            return;
        };
        if let Err(error) = listener.shutdown_and_join() {
            warn!(target: EVENTS_TARGET, error = %error, "event listener did not stop cleanly");
        }
        if dispatcher.join().is_err() {
            warn!(target: EVENTS_TARGET, "event dispatcher panicked");
        }
        self.table.close();
        info!(
            target: EVENTS_TARGET,
            received = self.received_events(),
            malformed = self.malformed_frames(),
            "event listener stopped"
        );
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn wait_on(
    subscription: &Subscription,
    timeout: Duration,
) -> Result<EventRecord, EventTimeoutError> {
    let listener_closed = match subscription.wait(timeout) {
        Received::Record(record) => return Ok(record),
        Received::TimedOut => false,
        Received::Closed => true,
    };
    Err(EventTimeoutError {
        pattern: subscription.pattern().to_string(),
        daemon_id: subscription.daemon_id().map(str::to_owned),
        timeout,
        listener_closed,
    })
}

fn dispatch(
    receiver: &Receiver<(EventFrame, SystemTime)>,
    table: &SubscriptionTable,
    history: &Mutex<History>,
    counters: &Counters,
) {
    let mut sequence = 0_u64;
    for (frame, received_at) in receiver {
        sequence += 1;
        let record = EventRecord {
            daemon_id: frame.daemon_id,
            tag: frame.tag,
            data: frame.data,
            received_at,
            sequence,
        };
        history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        let delivered = table.broadcast(&record);
        counters.received.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: EVENTS_TARGET,
            daemon_id = %record.daemon_id,
            tag = %record.tag,
            sequence,
            delivered,
            "event dispatched"
        );
    }
}

struct EventConnectionHandler {
    sender: Sender<(EventFrame, SystemTime)>,
    counters: Arc<Counters>,
}

impl ConnectionHandler for EventConnectionHandler {
    fn handle(&self, stream: ConnectionStream, guard: ConnectionGuard, shutdown: &AtomicBool) {
        let peer = stream.to_string();
        let mut origin: Option<String> = None;
        let served = serve_frames(stream, shutdown, |item| {
            let bytes = match item {
                FrameItem::Frame(bytes) => bytes,
                FrameItem::Oversized => {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!(target: EVENTS_TARGET, peer = %peer, "oversized event frame dropped");
                    return;
                }
            };
            match decode::<EventFrame>(&bytes) {
                Ok(frame) => {
                    if origin.is_none() {
                        guard.attribute(&frame.daemon_id);
                        origin = Some(frame.daemon_id.clone());
                    }
                    if self.sender.send((frame, SystemTime::now())).is_err() {
                        debug!(target: EVENTS_TARGET, peer = %peer, "dispatcher gone; event discarded");
                    }
                }
                Err(error) => {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        target: EVENTS_TARGET,
                        peer = %peer,
                        error = %error,
                        "malformed event frame dropped"
                    );
                }
            }
        });
        let daemon_id = origin.as_deref().unwrap_or("<unattributed>");
        match served {
            Served::Closed | Served::Shutdown => {
                debug!(target: EVENTS_TARGET, daemon_id, peer = %peer, "event channel closed");
            }
            Served::Failed(error) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: EVENTS_TARGET,
                    daemon_id,
                    peer = %peer,
                    error = %error,
                    "event channel dropped"
                );
            }
        }
    }
}
