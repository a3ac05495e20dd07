//! Live incident feed → ordered, deduplicated view.
//!
//! Every store delivery carries the full current set. [`reconcile`] turns it
//! into a [`ReconciledFeed`] which replaces the previous view in a single
//! watch-channel update, so readers never see a partial feed.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use civicwatch_core::config::ReconnectConfig;
use civicwatch_core::{IncidentRecord, RecordId};
use civicwatch_store::IncidentFeed;

use crate::binding::StoreBinding;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledIncident {
    pub record: IncidentRecord,
    /// Server timestamp, or reconciliation time while still pending.
    pub effective_at: DateTime<Utc>,
}

/// Immutable feed view, newest first. Cheap to clone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciledFeed {
    entries: Arc<[ReconciledIncident]>,
}

impl ReconciledFeed {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReconciledIncident> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[ReconciledIncident] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&ReconciledIncident> {
        self.entries.first()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.entries.iter().any(|e| &e.record.id == id)
    }

    pub fn ids(&self) -> HashSet<&RecordId> {
        self.entries.iter().map(|e| &e.record.id).collect()
    }
}

/// Build the ordered view of one delivery.
///
/// - one entry per id; a resolved timestamp beats a pending one, otherwise
///   the later entry in the delivery wins
/// - pending entries take `now` as their effective time
/// - sorted by effective time descending, ties broken by id descending
pub fn reconcile(records: Vec<IncidentRecord>, now: DateTime<Utc>) -> ReconciledFeed {
    let mut by_id: HashMap<RecordId, ReconciledIncident> = HashMap::with_capacity(records.len());
    for record in records {
        let effective_at = record.persisted_at.resolved().unwrap_or(now);
        let entry = ReconciledIncident {
            record,
            effective_at,
        };
        match by_id.entry(entry.record.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
            Entry::Occupied(mut slot) => {
                let downgrade =
                    entry.record.persisted_at.is_pending() && !slot.get().record.persisted_at.is_pending();
                if !downgrade {
                    slot.insert(entry);
                }
            }
        }
    }

    let mut entries: Vec<ReconciledIncident> = by_id.into_values().collect();
    entries.sort_by(|a, b| {
        b.effective_at
            .cmp(&a.effective_at)
            .then_with(|| b.record.id.cmp(&a.record.id))
    });
    ReconciledFeed {
        entries: entries.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedConnection {
    /// No delivery received on the current subscription yet.
    Connecting,
    Live,
    /// Subscription failed; the last good feed is retained.
    Broken { reason: String },
    /// Reconciler shut down.
    Closed,
}

impl FeedConnection {
    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Broken { .. })
    }
}

/// What readers see: the feed plus the health of the subscription behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedView {
    pub feed: ReconciledFeed,
    pub connection: FeedConnection,
    /// Successful deliveries applied so far, across reconnects.
    pub deliveries: u64,
}

impl Default for FeedView {
    fn default() -> Self {
        Self {
            feed: ReconciledFeed::default(),
            connection: FeedConnection::Connecting,
            deliveries: 0,
        }
    }
}

enum FeedEnd {
    Shutdown,
    Broken { delivered: bool },
}

/// Owns the store subscription and is the sole writer of the [`FeedView`].
pub struct IncidentFeedReconciler {
    binding: StoreBinding,
    reconnect: ReconnectConfig,
    tx: watch::Sender<FeedView>,
}

impl IncidentFeedReconciler {
    pub fn new(binding: StoreBinding, reconnect: ReconnectConfig) -> (Self, watch::Receiver<FeedView>) {
        let (tx, rx) = watch::channel(FeedView::default());
        (
            Self {
                binding,
                reconnect,
                tx,
            },
            rx,
        )
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Subscribe, apply deliveries, and resubscribe with backoff on failure
    /// until `shutdown` flips or reconnect attempts run out.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let collection = self.binding.collection().clone();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.binding.store().watch(&collection).await {
                Ok(mut feed) => {
                    debug!(collection = %collection, "incident feed subscribed");
                    let end = self.consume(&mut feed, &mut shutdown).await;
                    feed.cancel();
                    match end {
                        FeedEnd::Shutdown => break,
                        FeedEnd::Broken { delivered } => {
                            if delivered {
                                attempt = 0;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.mark_broken(e.to_string());
                }
            }

            attempt += 1;
            if attempt > self.reconnect.max_attempts {
                warn!(
                    collection = %collection,
                    attempts = attempt - 1,
                    "incident feed reconnect attempts exhausted, keeping last feed"
                );
                return;
            }
            let delay = self.reconnect.backoff_for(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "resubscribing to incident feed");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.tx.send_modify(|view| view.connection = FeedConnection::Closed);
        debug!(collection = %collection, "incident feed reconciler stopped");
    }

    async fn consume(&self, feed: &mut IncidentFeed, shutdown: &mut watch::Receiver<bool>) -> FeedEnd {
        let mut delivered = false;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return FeedEnd::Shutdown,
                delivery = feed.next_delivery() => match delivery {
                    Some(Ok(records)) => {
                        delivered = true;
                        self.apply(records);
                    }
                    Some(Err(e)) => {
                        self.mark_broken(e.to_string());
                        return FeedEnd::Broken { delivered };
                    }
                    None => {
                        self.mark_broken("feed closed by store".to_string());
                        return FeedEnd::Broken { delivered };
                    }
                },
            }
        }
    }

    fn apply(&self, records: Vec<IncidentRecord>) {
        let next = reconcile(records, Utc::now());

        let (first, new_ids): (bool, HashSet<RecordId>) = {
            let current = self.tx.borrow();
            let known = current.feed.ids();
            (
                current.deliveries == 0,
                next.iter()
                    .filter(|e| !known.contains(&e.record.id))
                    .map(|e| e.record.id.clone())
                    .collect(),
            )
        };

        if first {
            info!(incidents = next.len(), "incident feed loaded");
        } else {
            for entry in next.iter().filter(|e| new_ids.contains(&e.record.id)) {
                let draft = &entry.record.draft;
                warn!(
                    id = %entry.record.id,
                    kind = %draft.kind,
                    area = %draft.area,
                    severity = draft.status.label(),
                    description = %draft.description,
                    "new incident"
                );
            }
        }

        self.tx.send_modify(|view| {
            view.feed = next;
            view.connection = FeedConnection::Live;
            view.deliveries += 1;
        });
    }

    fn mark_broken(&self, reason: String) {
        warn!(reason = %reason, "incident feed subscription failed, keeping last feed");
        self.tx
            .send_modify(|view| view.connection = FeedConnection::Broken { reason });
    }
}
