use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use civicwatch_core::config::{MonitorConfig, OverlapPolicy};
use civicwatch_core::MetricSnapshot;
use civicwatch_rules::{ComplianceEvaluator, RuleCatalog};

use super::metrics::ScanMetrics;
use super::types::{ScanOutcome, ScanVerdict, TickResult};
use crate::binding::StoreBinding;
use crate::simulator::MetricSimulator;

/// Mutable per-tick state. Holding its lock is what "a tick is in flight" means.
struct TickState {
    simulator: MetricSimulator,
    current: MetricSnapshot,
    ticks: u64,
}

struct Shared {
    catalog: Arc<RuleCatalog>,
    binding: StoreBinding,
    policy: OverlapPolicy,
    state: Arc<tokio::sync::Mutex<TickState>>,
    /// A tick is waiting behind the in-flight one (Queue policy only).
    queued: AtomicBool,
    /// Bumped by `stop()`. A queued tick only runs in the run it was queued in.
    generation: AtomicU64,
    metrics: RwLock<ScanMetrics>,
    /// Sole writer of scan outcomes.
    outcomes: watch::Sender<Option<ScanOutcome>>,
    /// Last snapshot a tick accepted. Rejected ticks leave it alone.
    accepted: RwLock<MetricSnapshot>,
}

enum Slot {
    Acquired(OwnedMutexGuard<TickState>),
    Queued,
    Skipped,
}

impl Shared {
    fn try_slot(&self) -> Slot {
        match self.state.clone().try_lock_owned() {
            Ok(guard) => Slot::Acquired(guard),
            Err(_) => match self.policy {
                OverlapPolicy::Queue if !self.queued.swap(true, Ordering::SeqCst) => Slot::Queued,
                _ => {
                    debug!(policy = %self.policy, "tick already in flight, skipping");
                    if let Ok(mut metrics) = self.metrics.write() {
                        metrics.record_skip();
                    }
                    Slot::Skipped
                }
            },
        }
    }

    async fn wait_queued(&self) -> OwnedMutexGuard<TickState> {
        let guard = self.state.clone().lock_owned().await;
        self.queued.store(false, Ordering::SeqCst);
        guard
    }

    async fn run_tick(&self, mut guard: OwnedMutexGuard<TickState>) -> ScanOutcome {
        let started = Instant::now();
        let state = &mut *guard;
        state.ticks += 1;
        let tick = state.ticks;

        let snapshot = match state.simulator.next(&state.current, Utc::now()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(tick, error = %e, "simulator produced a malformed snapshot, tick skipped");
                let outcome = ScanOutcome {
                    tick,
                    snapshot: None,
                    verdict: ScanVerdict::SnapshotRejected,
                    appended: Vec::new(),
                    write_error: None,
                    finished_at: Utc::now(),
                };
                self.publish(&outcome, started.elapsed());
                return outcome;
            }
        };

        let evaluation = ComplianceEvaluator::evaluate(&snapshot, &self.catalog);
        let verdict = if evaluation.is_compliant {
            ScanVerdict::Compliant
        } else {
            ScanVerdict::IncidentsDetected {
                drafts: evaluation.drafts.len(),
            }
        };

        let mut appended = Vec::with_capacity(evaluation.drafts.len());
        let mut write_error = None;
        for (i, draft) in evaluation.drafts.iter().enumerate() {
            match self
                .binding
                .store()
                .append(self.binding.collection(), draft)
                .await
            {
                Ok(id) => {
                    info!(
                        tick,
                        id = %id,
                        kind = %draft.kind,
                        area = %draft.area,
                        severity = draft.status.label(),
                        "incident recorded"
                    );
                    appended.push(id);
                }
                Err(e) => {
                    let abandoned = evaluation.drafts.len() - i;
                    if e.is_store_error() {
                        warn!(tick, error = %e, abandoned, "incident append failed, abandoning rest of tick");
                    } else {
                        error!(tick, error = %e, abandoned, "unexpected append error, abandoning rest of tick");
                    }
                    write_error = Some(e.to_string());
                    break;
                }
            }
        }

        state.current = snapshot;
        if let Ok(mut accepted) = self.accepted.write() {
            *accepted = snapshot;
        }
        let outcome = ScanOutcome {
            tick,
            snapshot: Some(snapshot),
            verdict,
            appended,
            write_error,
            finished_at: Utc::now(),
        };
        self.publish(&outcome, started.elapsed());
        outcome
    }

    fn publish(&self, outcome: &ScanOutcome, elapsed: Duration) {
        if let Ok(mut metrics) = self.metrics.write() {
            metrics.record_outcome(outcome, elapsed);
        }
        debug!(
            tick = outcome.tick,
            verdict = ?outcome.verdict,
            appended = outcome.appended.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "tick finished"
        );
        self.outcomes.send_replace(Some(outcome.clone()));
    }
}

/// Dispatch one interval tick without blocking the loop.
fn dispatch(shared: &Arc<Shared>) {
    match shared.try_slot() {
        Slot::Acquired(guard) => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                shared.run_tick(guard).await;
            });
        }
        Slot::Queued => {
            let shared = Arc::clone(shared);
            let generation = shared.generation.load(Ordering::SeqCst);
            tokio::spawn(async move {
                let guard = shared.wait_queued().await;
                if shared.generation.load(Ordering::SeqCst) != generation {
                    debug!(generation, "scheduler stopped while tick was queued, dropping it");
                    return;
                }
                shared.run_tick(guard).await;
            });
        }
        Slot::Skipped => {}
    }
}

async fn run_loop(shared: Arc<Shared>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    // First tick after one full period.
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = interval.tick() => dispatch(&shared),
        }
    }
    debug!("scan loop exited");
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Periodic scan driver.
///
/// Ticks run as detached tasks so `stop()` never aborts an in-flight append;
/// it only guarantees that no new tick starts afterwards.
pub struct ScanScheduler {
    shared: Arc<Shared>,
    period: Duration,
    running: Mutex<Option<LoopHandle>>,
}

impl ScanScheduler {
    pub fn new(
        config: &MonitorConfig,
        catalog: Arc<RuleCatalog>,
        binding: StoreBinding,
        simulator: MetricSimulator,
        initial: MetricSnapshot,
    ) -> Self {
        let (outcomes, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                catalog,
                binding,
                policy: config.overlap_policy,
                state: Arc::new(tokio::sync::Mutex::new(TickState {
                    simulator,
                    current: initial,
                    ticks: 0,
                })),
                queued: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                metrics: RwLock::new(ScanMetrics::default()),
                outcomes,
                accepted: RwLock::new(initial),
            }),
            period: config.scan_period(),
            running: Mutex::new(None),
        }
    }

    /// Start the periodic loop. Returns `false` if it was already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let Ok(mut running) = self.running.lock() else {
            error!("scan scheduler state lock poisoned");
            return false;
        };
        if running.is_some() {
            debug!("scan scheduler already running");
            return false;
        }

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(Arc::clone(&self.shared), self.period, rx));
        *running = Some(LoopHandle { shutdown, task });

        info!(
            period_ms = self.period.as_millis() as u64,
            policy = %self.shared.policy,
            rules = self.shared.catalog.len(),
            collection = %self.shared.binding.collection().path(),
            "scan scheduler started"
        );
        true
    }

    /// Stop the loop. Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let handle = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => {
                error!("scan scheduler state lock poisoned");
                None
            }
        };
        let Some(handle) = handle else {
            return false;
        };

        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.task.await {
            warn!(error = %e, "scan loop task ended abnormally");
        }
        info!("scan scheduler stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    /// Run one tick now, under the same overlap policy as the loop.
    pub async fn scan_once(&self) -> TickResult {
        let guard = match self.shared.try_slot() {
            Slot::Acquired(guard) => guard,
            Slot::Queued => self.shared.wait_queued().await,
            Slot::Skipped => return TickResult::Skipped,
        };
        TickResult::Ran(self.shared.run_tick(guard).await)
    }

    pub fn metrics(&self) -> ScanMetrics {
        self.shared
            .metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Latest tick outcome; `None` until the first tick finishes.
    pub fn outcomes(&self) -> watch::Receiver<Option<ScanOutcome>> {
        self.shared.outcomes.subscribe()
    }

    /// Last accepted snapshot, or the initial one before any tick.
    pub fn current_snapshot(&self) -> MetricSnapshot {
        match self.shared.accepted.read() {
            Ok(accepted) => *accepted,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn binding(&self) -> &StoreBinding {
        &self.shared.binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::ScriptedPerturbation;
    use civicwatch_core::config::StoreConfig;
    use civicwatch_core::PrincipalId;
    use civicwatch_store::MemoryIncidentStore;

    fn scheduler(
        store: &MemoryIncidentStore,
        config: &MonitorConfig,
        waste: Vec<f64>,
        traffic: Vec<f64>,
    ) -> ScanScheduler {
        let binding = StoreBinding::new(
            Arc::new(store.clone()),
            &StoreConfig::default(),
            &PrincipalId("tester".into()),
        );
        let simulator =
            MetricSimulator::with_source(config, Box::new(ScriptedPerturbation::new(waste, traffic)));
        let initial = MetricSnapshot::new(0.5, 0.4, Utc::now()).unwrap();
        ScanScheduler::new(
            config,
            Arc::new(RuleCatalog::reference()),
            binding,
            simulator,
            initial,
        )
    }

    #[tokio::test]
    async fn compliant_tick_appends_nothing() {
        let store = MemoryIncidentStore::new();
        let s = scheduler(&store, &MonitorConfig::default(), vec![0.1], vec![0.1]);

        let outcome = s.scan_once().await.outcome().cloned().unwrap();
        assert_eq!(outcome.tick, 1);
        assert_eq!(outcome.verdict, ScanVerdict::Compliant);
        assert!(outcome.appended.is_empty());
        assert!(store.records(s.binding().collection()).is_empty());
        assert!((s.current_snapshot().waste_volume() - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn violating_tick_appends_one_record_per_rule() {
        let store = MemoryIncidentStore::new();
        let s = scheduler(&store, &MonitorConfig::default(), vec![0.4], vec![0.4]);

        let outcome = s.scan_once().await.outcome().cloned().unwrap();
        assert_eq!(outcome.verdict, ScanVerdict::IncidentsDetected { drafts: 2 });
        assert_eq!(outcome.appended.len(), 2);

        let records = store.records(s.binding().collection());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].draft.kind, "waste");
        assert_eq!(records[1].draft.kind, "traffic");

        let m = s.metrics();
        assert_eq!(m.ticks_run, 1);
        assert_eq!(m.drafts_emitted, 2);
        assert_eq!(m.records_appended, 2);
    }

    #[tokio::test]
    async fn failed_append_abandons_rest_of_tick_only() {
        let store = MemoryIncidentStore::new();
        store.fail_next_appends(1);
        // Tick 1 fires both rules; tick 2 stays above both thresholds.
        let s = scheduler(&store, &MonitorConfig::default(), vec![0.4, 0.0], vec![0.4, 0.0]);

        let first = s.scan_once().await.outcome().cloned().unwrap();
        assert_eq!(first.verdict, ScanVerdict::IncidentsDetected { drafts: 2 });
        assert!(first.appended.is_empty());
        assert!(first.write_error.is_some());
        assert_eq!(first.abandoned(), 2);
        assert_eq!(store.append_attempts(), 1);

        let second = s.scan_once().await.outcome().cloned().unwrap();
        assert_eq!(second.tick, 2);
        assert_eq!(second.appended.len(), 2);
        assert!(second.write_error.is_none());

        let m = s.metrics();
        assert_eq!(m.append_failures, 1);
        assert_eq!(m.records_appended, 2);
    }

    #[tokio::test]
    async fn malformed_snapshot_is_not_evaluated() {
        let store = MemoryIncidentStore::new();
        let s = scheduler(&store, &MonitorConfig::default(), vec![f64::NAN, 0.4], vec![0.0, 0.4]);

        let rejected = s.scan_once().await.outcome().cloned().unwrap();
        assert_eq!(rejected.verdict, ScanVerdict::SnapshotRejected);
        assert!(rejected.snapshot.is_none());
        assert_eq!(store.append_attempts(), 0);
        // The previous snapshot is kept.
        assert!((s.current_snapshot().waste_volume() - 0.5).abs() < 1e-9);

        let next = s.scan_once().await.outcome().cloned().unwrap();
        assert_eq!(next.verdict, ScanVerdict::IncidentsDetected { drafts: 2 });
        assert_eq!(s.metrics().snapshots_rejected, 1);
    }

    #[tokio::test]
    async fn rejected_tick_keeps_last_accepted_snapshot() {
        let store = MemoryIncidentStore::new();
        let s = scheduler(&store, &MonitorConfig::default(), vec![0.35, f64::NAN], vec![0.0, 0.0]);

        let first = s.scan_once().await.outcome().cloned().unwrap();
        assert_eq!(first.verdict, ScanVerdict::IncidentsDetected { drafts: 1 });
        assert!((s.current_snapshot().waste_volume() - 0.85).abs() < 1e-9);

        let second = s.scan_once().await.outcome().cloned().unwrap();
        assert_eq!(second.verdict, ScanVerdict::SnapshotRejected);
        assert!((s.current_snapshot().waste_volume() - 0.85).abs() < 1e-9);
        assert!((s.current_snapshot().traffic_density() - 0.4).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_tick_does_not_survive_restart() {
        let store = MemoryIncidentStore::new();
        store.set_append_delay(Some(Duration::from_secs(10)));
        let mut config = MonitorConfig::default();
        config.scan_period_ms = 4_000;
        config.overlap_policy = OverlapPolicy::Queue;
        let s = scheduler(&store, &config, vec![0.4], vec![]);

        // 4s runs to 14s; 8s queues behind it.
        s.start();
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(s.stop().await);
        assert!(s.start());

        // New run: 13s is skipped (queue still held by the old waiter), the
        // old waiter wakes at 14s and is dropped, 17s runs to 27s.
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(s.metrics().ticks_run, 1);
        assert_eq!(store.append_attempts(), 2);

        s.stop().await;
    }

    #[tokio::test]
    async fn outcomes_channel_tracks_latest_tick() {
        let store = MemoryIncidentStore::new();
        let s = scheduler(&store, &MonitorConfig::default(), vec![0.4, -0.4], vec![]);
        let rx = s.outcomes();
        assert!(rx.borrow().is_none());

        s.scan_once().await;
        assert_eq!(rx.borrow().as_ref().map(|o| o.tick), Some(1));
        s.scan_once().await;
        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.tick, 2);
        assert_eq!(latest.verdict, ScanVerdict::Compliant);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let store = MemoryIncidentStore::new();
        let mut config = MonitorConfig::default();
        config.scan_period_ms = 1_000;
        let s = scheduler(&store, &config, vec![], vec![]);

        assert!(s.start());
        assert!(!s.start());
        assert!(s.is_running());

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(s.metrics().ticks_run, 3);

        assert!(s.stop().await);
        assert!(!s.stop().await);
        assert!(!s.is_running());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(s.metrics().ticks_run, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_period() {
        let store = MemoryIncidentStore::new();
        let mut config = MonitorConfig::default();
        config.scan_period_ms = 4_000;
        let s = scheduler(&store, &config, vec![], vec![]);
        s.start();

        tokio::time::sleep(Duration::from_millis(3_900)).await;
        assert_eq!(s.metrics().ticks_run, 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(s.metrics().ticks_run, 1);
        s.stop().await;
    }
}
