//! In-process incident store.
//!
//! Behaves like the remote document store the monitor talks to in
//! production: multiple writers, store-assigned ids and timestamps, and a
//! live feed that re-delivers the whole collection on every change in
//! insertion order (no server-side ordering). Fault injection hooks let
//! tests break writes and subscriptions on demand.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use civicwatch_core::{
    CivicError, CollectionRef, IncidentDraft, IncidentRecord, PersistedAt, RecordId, Result,
};

use crate::feed::{FeedSender, IncidentFeed};
use crate::traits::IncidentStore;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Faults {
    /// Remaining appends that fail unconditionally.
    fail_next: usize,
    /// Append attempt numbers (0-based, store-wide) that fail.
    fail_at: HashSet<u64>,
    append_delay: Option<Duration>,
    /// When set, `watch` is refused with this reason.
    refuse_watch: Option<String>,
}

struct Subscriber {
    collection: String,
    tx: FeedSender,
}

#[derive(Default)]
struct Inner {
    collections: Mutex<HashMap<String, Vec<IncidentRecord>>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    faults: Mutex<Faults>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
    next_subscriber: AtomicU64,
    append_attempts: AtomicU64,
    unsubscribes: AtomicUsize,
    latency_compensation: bool,
}

impl Inner {
    /// Server clock. Strictly increasing so two writes never share a timestamp.
    fn server_timestamp(&self) -> DateTime<Utc> {
        let mut last = lock(&self.last_timestamp);
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + chrono::Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    /// Push the full current set to every subscriber of `collection`.
    ///
    /// Lock order is subscribers then collections, so concurrent publishes
    /// reach each subscriber in the order they read the collection.
    fn publish(&self, collection: &str) {
        let mut subscribers = lock(&self.subscribers);
        let records = lock(&self.collections)
            .get(collection)
            .cloned()
            .unwrap_or_default();
        subscribers.retain(|_, sub| {
            sub.collection != collection || sub.tx.send(Ok(records.clone())).is_ok()
        });
    }

    fn insert(&self, collection: &str, record: IncidentRecord) {
        lock(&self.collections)
            .entry(collection.to_string())
            .or_default()
            .push(record);
    }

    fn resolve(&self, collection: &str, id: &RecordId, at: DateTime<Utc>) {
        if let Some(records) = lock(&self.collections).get_mut(collection) {
            if let Some(record) = records.iter_mut().find(|r| &r.id == id) {
                record.persisted_at = PersistedAt::Resolved(at);
            }
        }
    }

    fn should_fail(&self, attempt: u64) -> bool {
        let mut faults = lock(&self.faults);
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return true;
        }
        faults.fail_at.remove(&attempt)
    }
}

/// Multi-writer in-memory incident store. Cheap to clone; clones share data.
#[derive(Clone, Default)]
pub struct MemoryIncidentStore {
    inner: Arc<Inner>,
}

impl MemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver each new record first with a pending timestamp, then again
    /// once the timestamp resolves, like a store with local write latency
    /// compensation.
    pub fn with_latency_compensation() -> Self {
        Self {
            inner: Arc::new(Inner {
                latency_compensation: true,
                ..Inner::default()
            }),
        }
    }

    /// Make the next `n` appends fail.
    pub fn fail_next_appends(&self, n: usize) {
        lock(&self.inner.faults).fail_next = n;
    }

    /// Make the append attempt with this store-wide sequence number fail.
    pub fn fail_append_at(&self, attempt: u64) {
        lock(&self.inner.faults).fail_at.insert(attempt);
    }

    /// Every append sleeps this long before it is applied.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        lock(&self.inner.faults).append_delay = delay;
    }

    /// Refuse new subscriptions (`Some(reason)`) or accept them again (`None`).
    pub fn refuse_watch(&self, reason: Option<String>) {
        lock(&self.inner.faults).refuse_watch = reason;
    }

    /// Break every live subscription with `reason`. Subscribers get one
    /// error delivery and nothing afterwards.
    pub fn break_subscriptions(&self, reason: &str) {
        let mut subscribers = lock(&self.inner.subscribers);
        for (_, sub) in subscribers.drain() {
            let _ = sub
                .tx
                .send(Err(CivicError::StoreSubscription(reason.to_string())));
        }
        warn!(reason, "all subscriptions broken");
    }

    /// Write a record as another client would, with an arbitrary timestamp.
    pub fn insert_foreign(
        &self,
        collection: &CollectionRef,
        draft: IncidentDraft,
        persisted_at: PersistedAt,
    ) -> RecordId {
        let id = new_record_id();
        self.inner.insert(
            collection.path(),
            IncidentRecord {
                id: id.clone(),
                draft,
                persisted_at,
            },
        );
        self.inner.publish(collection.path());
        id
    }

    /// Current contents of a collection, in insertion order.
    pub fn records(&self, collection: &CollectionRef) -> Vec<IncidentRecord> {
        lock(&self.inner.collections)
            .get(collection.path())
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_subscriptions(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Number of subscriptions torn down by their consumer.
    pub fn unsubscribe_count(&self) -> usize {
        self.inner.unsubscribes.load(Ordering::SeqCst)
    }

    /// Append attempts so far, failed ones included.
    pub fn append_attempts(&self) -> u64 {
        self.inner.append_attempts.load(Ordering::SeqCst)
    }
}

fn new_record_id() -> RecordId {
    RecordId(uuid::Uuid::new_v4().simple().to_string())
}

#[async_trait]
impl IncidentStore for MemoryIncidentStore {
    async fn append(&self, collection: &CollectionRef, draft: &IncidentDraft) -> Result<RecordId> {
        let attempt = self.inner.append_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = lock(&self.inner.faults).append_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.should_fail(attempt) {
            return Err(CivicError::StoreWrite(format!(
                "append #{} to {} rejected",
                attempt, collection
            )));
        }

        let id = new_record_id();
        let path = collection.path();
        if self.inner.latency_compensation {
            self.inner.insert(
                path,
                IncidentRecord {
                    id: id.clone(),
                    draft: draft.clone(),
                    persisted_at: PersistedAt::Pending,
                },
            );
            self.inner.publish(path);
            let at = self.inner.server_timestamp();
            self.inner.resolve(path, &id, at);
        } else {
            let at = self.inner.server_timestamp();
            self.inner.insert(
                path,
                IncidentRecord {
                    id: id.clone(),
                    draft: draft.clone(),
                    persisted_at: PersistedAt::Resolved(at),
                },
            );
        }
        self.inner.publish(path);

        debug!(collection = %collection, id = %id, kind = %draft.kind, "incident appended");
        Ok(id)
    }

    async fn watch(&self, collection: &CollectionRef) -> Result<IncidentFeed> {
        if let Some(reason) = lock(&self.inner.faults).refuse_watch.clone() {
            return Err(CivicError::StoreSubscription(reason));
        }

        let sub_id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.inner);
        let (tx, feed) = IncidentFeed::channel(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.subscribers).remove(&sub_id);
                inner.unsubscribes.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Initial delivery is the collection as it is right now. The
        // subscriber lock is held across read + register so no publish
        // falls between them.
        let mut subscribers = lock(&self.inner.subscribers);
        let current = self.records(collection);
        if tx.send(Ok(current)).is_ok() {
            subscribers.insert(
                sub_id,
                Subscriber {
                    collection: collection.path().to_string(),
                    tx,
                },
            );
        }
        drop(subscribers);
        debug!(collection = %collection, subscriber = sub_id, "subscription opened");
        Ok(feed)
    }
}
