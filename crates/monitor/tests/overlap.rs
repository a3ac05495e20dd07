//! Tick serialization under a slow store, on a paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use civicwatch_core::config::OverlapPolicy;
use civicwatch_core::{CollectionRef, Config, IncidentDraft, RecordId, Result};
use civicwatch_monitor::{ComplianceMonitor, ScriptedPerturbation};
use civicwatch_rules::RuleCatalog;
use civicwatch_store::{IncidentFeed, IncidentStore, LocalIdentity, MemoryIncidentStore};

/// Wraps the memory store and records the peak number of concurrent appends.
#[derive(Default)]
struct CountingStore {
    inner: MemoryIncidentStore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl IncidentStore for CountingStore {
    async fn append(&self, collection: &CollectionRef, draft: &IncidentDraft) -> Result<RecordId> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.inner.append(collection, draft).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn watch(&self, collection: &CollectionRef) -> Result<IncidentFeed> {
        self.inner.watch(collection).await
    }
}

/// 4s period, 10s appends, waste pinned above its threshold from tick 1.
fn slow_monitor(policy: OverlapPolicy) -> (Arc<CountingStore>, ComplianceMonitor) {
    let store = Arc::new(CountingStore::default());
    store.inner.set_append_delay(Some(Duration::from_secs(10)));

    let mut config = Config::default();
    config.monitor.scan_period_ms = 4_000;
    config.monitor.overlap_policy = policy;

    let monitor = ComplianceMonitor::new(
        config,
        Arc::new(RuleCatalog::reference()),
        store.clone(),
        Arc::new(LocalIdentity::new()),
    )
    .with_perturbation(Box::new(ScriptedPerturbation::new([0.4], [])));
    (store, monitor)
}

#[tokio::test(start_paused = true)]
async fn skip_policy_drops_ticks_while_busy() {
    let (store, monitor) = slow_monitor(OverlapPolicy::Skip);
    monitor.start().await.unwrap();

    // Ticks at 4s (runs to 14s), 8s/12s skipped, 16s (to 26s), 20s/24s
    // skipped, 28s in flight.
    tokio::time::sleep(Duration::from_secs(30)).await;

    let metrics = monitor.scan_metrics().unwrap();
    assert_eq!(metrics.ticks_run, 2);
    assert_eq!(metrics.ticks_skipped, 4);
    assert_eq!(store.peak.load(Ordering::SeqCst), 1);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn queue_policy_runs_one_waiting_tick_next() {
    let (store, monitor) = slow_monitor(OverlapPolicy::Queue);
    monitor.start().await.unwrap();

    // 4s runs to 14s; 8s queues and runs 14s-24s; 12s is dropped (queue
    // full); 16s queues and runs 24s-34s; 20s dropped; 28s queues.
    tokio::time::sleep(Duration::from_secs(30)).await;

    let metrics = monitor.scan_metrics().unwrap();
    assert_eq!(metrics.ticks_run, 2);
    assert_eq!(metrics.ticks_skipped, 2);
    assert_eq!(store.peak.load(Ordering::SeqCst), 1);

    // The in-flight tick completes after stop; the queued one never starts.
    monitor.stop().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    let metrics = monitor.scan_metrics().unwrap();
    assert_eq!(metrics.ticks_run, 3);
    assert_eq!(metrics.records_appended, 3);
    assert_eq!(store.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_scan_respects_in_flight_tick() {
    let (_store, monitor) = slow_monitor(OverlapPolicy::Skip);
    monitor.start().await.unwrap();

    // Loop tick at 4s is mid-append at 5s.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let result = monitor.scan_once().await.unwrap();
    assert!(result.outcome().is_none());
    assert_eq!(monitor.scan_metrics().unwrap().ticks_skipped, 1);

    monitor.stop().await;
}
