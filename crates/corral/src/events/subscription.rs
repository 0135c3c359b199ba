//! Subscriptions and the table the dispatcher fans events out over.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use super::{EventRecord, TagPattern};

/// Records a subscription buffers before the oldest are discarded.
const SUBSCRIPTION_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct Inbox {
    records: VecDeque<EventRecord>,
    closed: bool,
    overflowed: u64,
}

#[derive(Debug, Default)]
struct Shared {
    inbox: Mutex<Inbox>,
    ready: Condvar,
}

impl Shared {
    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offer(&self, record: &EventRecord) {
        let mut inbox = self.inbox();
        if inbox.closed {
            return;
        }
        if inbox.records.len() >= SUBSCRIPTION_CAPACITY {
            inbox.records.pop_front();
            inbox.overflowed += 1;
        }
        inbox.records.push_back(record.clone());
        drop(inbox);
        self.ready.notify_all();
    }

    fn close(&self) {
        self.inbox().closed = true;
        self.ready.notify_all();
    }
}

/// Result of waiting on a subscription.
#[derive(Debug)]
pub(crate) enum Received {
    Record(EventRecord),
    TimedOut,
    Closed,
}

struct Subscriber {
    pattern: TagPattern,
    daemon_id: Option<String>,
    shared: Arc<Shared>,
}

impl Subscriber {
    fn wants(&self, record: &EventRecord) -> bool {
        self.daemon_id
            .as_deref()
            .is_none_or(|daemon_id| daemon_id == record.daemon_id)
            && self.pattern.matches(&record.tag)
    }
}

/// Live subscriptions, guarded independently of the log server.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    next_id: AtomicU64,
    closed: AtomicBool,
    entries: Mutex<BTreeMap<u64, Subscriber>>,
}

impl SubscriptionTable {
    fn entries(&self) -> MutexGuard<'_, BTreeMap<u64, Subscriber>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        pattern: TagPattern,
        daemon_id: Option<String>,
    ) -> Subscription {
        let shared = Arc::new(Shared::default());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries();
        if self.closed.load(Ordering::SeqCst) {
            shared.close();
        } else {
            entries.insert(
                id,
                Subscriber {
                    pattern: pattern.clone(),
                    daemon_id: daemon_id.clone(),
                    shared: Arc::clone(&shared),
                },
            );
        }
        drop(entries);
        Subscription {
            id,
            pattern,
            daemon_id,
            shared,
            table: Arc::downgrade(self),
        }
    }

    /// Delivers `record` to every matching subscription. Returns the number
    /// of subscriptions that received it.
    pub(crate) fn broadcast(&self, record: &EventRecord) -> usize {
        let entries = self.entries();
        let mut delivered = 0;
        for subscriber in entries.values().filter(|subscriber| subscriber.wants(record)) {
            subscriber.shared.offer(record);
            delivered += 1;
        }
        delivered
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }

    /// Wakes every waiter and refuses new subscriptions.
    pub(crate) fn close(&self) {
        let mut entries = self.entries();
        self.closed.store(true, Ordering::SeqCst);
        for subscriber in entries.values() {
            subscriber.shared.close();
        }
        entries.clear();
    }

    fn remove(&self, id: u64) {
        self.entries().remove(&id);
    }
}

/// A caller's interest in events whose tag matches a pattern.
///
/// Every matching event received after the subscription was created is
/// buffered, in arrival order, until taken with [`Subscription::next`]. Other
/// subscriptions with overlapping patterns see the same events. Dropping the
/// subscription releases it.
pub struct Subscription {
    id: u64,
    pattern: TagPattern,
    daemon_id: Option<String>,
    shared: Arc<Shared>,
    table: Weak<SubscriptionTable>,
}

impl Subscription {
    /// Pattern this subscription selects by.
    #[must_use]
    pub const fn pattern(&self) -> &TagPattern {
        &self.pattern
    }

    /// Origin filter, when the subscription is scoped to one daemon.
    #[must_use]
    pub fn daemon_id(&self) -> Option<&str> {
        self.daemon_id.as_deref()
    }

    /// Takes the next buffered record without waiting.
    #[must_use]
    pub fn try_next(&self) -> Option<EventRecord> {
        self.shared.inbox().records.pop_front()
    }

    /// Waits up to `timeout` for the next record.
    ///
    /// Returns `None` when the timeout elapses or the listener shuts down
    /// with nothing left in the buffer.
    #[must_use]
    pub fn next(&self, timeout: Duration) -> Option<EventRecord> {
        match self.wait(timeout) {
            Received::Record(record) => Some(record),
            Received::TimedOut | Received::Closed => None,
        }
    }

    /// Reports whether the listener has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.inbox().closed
    }

    /// Number of records discarded because the buffer was full.
    #[must_use]
    pub fn overflowed(&self) -> u64 {
        self.shared.inbox().overflowed
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Received {
        let deadline = crate::deadline::after(timeout);
        let mut inbox = self.shared.inbox();
        loop {
            if let Some(record) = inbox.records.pop_front() {
                return Received::Record(record);
            }
            if inbox.closed {
                return Received::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Received::TimedOut;
            }
            inbox = self
                .shared
                .ready
                .wait_timeout(inbox, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern.to_string())
            .field("daemon_id", &self.daemon_id)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(self.id);
        }
    }
}
