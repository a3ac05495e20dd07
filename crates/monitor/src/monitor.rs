//! Top-level orchestrator.
//!
//! Lifecycle: `Initializing` until identity is acquired and the store is
//! bound, then `Running` (scan loop, feed reconciler and status aggregator
//! all live) until `stop()`. A stopped monitor can be started again; it keeps
//! its principal, scheduler state and status receivers.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use civicwatch_core::{Config, MetricSnapshot, PrincipalId, Result};
use civicwatch_rules::RuleCatalog;
use civicwatch_store::{acquire_principal, IdentityProvider, IncidentStore};

use crate::binding::StoreBinding;
use crate::reconciler::{FeedView, IncidentFeedReconciler, ReconciledFeed};
use crate::scheduler::{ScanMetrics, ScanScheduler, TickResult};
use crate::simulator::{MetricSimulator, PerturbationSource};
use crate::status::{StatusAggregator, StatusSources, SystemStatus};

/// Parts that exist once identity bootstrap succeeded.
#[derive(Clone)]
struct Bound {
    principal: PrincipalId,
    binding: StoreBinding,
    scheduler: Arc<ScanScheduler>,
}

/// Read side, replaced on every start.
#[derive(Clone)]
struct View {
    bound: Bound,
    sources: StatusSources,
    feed: watch::Receiver<FeedView>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    reconciler: JoinHandle<()>,
    aggregator: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    bound: Option<Bound>,
    running: Option<Running>,
}

pub struct ComplianceMonitor {
    config: Config,
    catalog: Arc<RuleCatalog>,
    store: Arc<dyn IncidentStore>,
    identity: Arc<dyn IdentityProvider>,
    /// Injected step source, consumed when the scheduler is built.
    perturbation: Mutex<Option<Box<dyn PerturbationSource>>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    view: RwLock<Option<View>>,
    status_tx: Arc<watch::Sender<SystemStatus>>,
}

impl ComplianceMonitor {
    pub fn new(
        config: Config,
        catalog: Arc<RuleCatalog>,
        store: Arc<dyn IncidentStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SystemStatus::Initializing);
        Self {
            config,
            catalog,
            store,
            identity,
            perturbation: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            view: RwLock::new(None),
            status_tx: Arc::new(status_tx),
        }
    }

    /// Replace the random walk with a fixed step source. Only effective
    /// before the first `start()`.
    pub fn with_perturbation(self, source: Box<dyn PerturbationSource>) -> Self {
        if let Ok(mut slot) = self.perturbation.lock() {
            *slot = Some(source);
        }
        self
    }

    /// Bootstrap identity (first call only) and start scanning and watching.
    ///
    /// Idempotent while running. On error nothing is started and status
    /// stays `Initializing`.
    pub async fn start(&self) -> Result<PrincipalId> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let (Some(bound), Some(_)) = (&lifecycle.bound, &lifecycle.running) {
            debug!(principal = %bound.principal, "compliance monitor already running");
            return Ok(bound.principal.clone());
        }

        let bound = match lifecycle.bound.clone() {
            Some(bound) => bound,
            None => {
                let bound = self.bind().await?;
                lifecycle.bound = Some(bound.clone());
                bound
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (reconciler, feed) =
            IncidentFeedReconciler::new(bound.binding.clone(), self.config.reconnect.clone());
        let sources = StatusSources::new(bound.scheduler.outcomes(), feed.clone());

        let reconciler = reconciler.spawn(shutdown_rx.clone());
        let aggregator =
            StatusAggregator::new(sources.clone(), Arc::clone(&self.status_tx)).spawn(shutdown_rx);
        bound.scheduler.start();

        if let Ok(mut view) = self.view.write() {
            *view = Some(View {
                bound: bound.clone(),
                sources,
                feed,
            });
        }
        lifecycle.running = Some(Running {
            shutdown,
            reconciler,
            aggregator,
        });

        info!(
            principal = %bound.principal,
            collection = %bound.binding.collection().path(),
            profile = self.config.profile_label(),
            "compliance monitor started"
        );
        Ok(bound.principal)
    }

    async fn bind(&self) -> Result<Bound> {
        if let Err(e) = self.config.validate() {
            error!(error = %e, "invalid configuration, monitor stays initializing");
            return Err(e);
        }

        let principal = acquire_principal(
            self.identity.as_ref(),
            self.config.identity.auth_token.as_deref(),
            self.config.identity.timeout(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "identity acquisition failed, monitor stays initializing");
            e
        })?;

        let binding = StoreBinding::new(Arc::clone(&self.store), &self.config.store, &principal);
        let monitor = &self.config.monitor;
        let initial = MetricSnapshot::new(
            monitor.initial_waste_volume,
            monitor.initial_traffic_density,
            Utc::now(),
        )?;
        let injected = self.perturbation.lock().ok().and_then(|mut slot| slot.take());
        let simulator = match injected {
            Some(source) => MetricSimulator::with_source(monitor, source),
            None => MetricSimulator::from_config(monitor),
        };
        let scheduler = Arc::new(ScanScheduler::new(
            monitor,
            Arc::clone(&self.catalog),
            binding.clone(),
            simulator,
            initial,
        ));

        Ok(Bound {
            principal,
            binding,
            scheduler,
        })
    }

    /// Stop scanning and release the feed subscription. In-flight ticks
    /// finish on their own. Returns `false` if the monitor was not running.
    pub async fn stop(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.running.take() else {
            return false;
        };
        if let Some(bound) = &lifecycle.bound {
            bound.scheduler.stop().await;
        }

        let _ = running.shutdown.send(true);
        for (task, handle) in [("reconciler", running.reconciler), ("aggregator", running.aggregator)] {
            if let Err(e) = handle.await {
                warn!(task, error = %e, "monitor task ended abnormally");
            }
        }
        info!("compliance monitor stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running.is_some()
    }

    fn current_view(&self) -> Option<View> {
        self.view.read().ok().and_then(|view| view.clone())
    }

    /// Status derived from the latest inputs.
    pub fn status(&self) -> SystemStatus {
        self.current_view()
            .map(|view| view.sources.current())
            .unwrap_or(SystemStatus::Initializing)
    }

    /// Status transitions as published by the aggregator.
    pub fn subscribe_status(&self) -> watch::Receiver<SystemStatus> {
        self.status_tx.subscribe()
    }

    /// The last reconciled feed; empty before the first delivery.
    pub fn feed(&self) -> ReconciledFeed {
        self.current_view()
            .map(|view| view.feed.borrow().feed.clone())
            .unwrap_or_default()
    }

    /// Feed updates for the current run; `None` before the first start.
    pub fn subscribe_feed(&self) -> Option<watch::Receiver<FeedView>> {
        self.current_view().map(|view| view.feed)
    }

    pub fn scan_metrics(&self) -> Option<ScanMetrics> {
        self.current_view().map(|view| view.bound.scheduler.metrics())
    }

    pub fn principal(&self) -> Option<PrincipalId> {
        self.current_view().map(|view| view.bound.principal)
    }

    pub fn current_snapshot(&self) -> Option<MetricSnapshot> {
        self.current_view()
            .map(|view| view.bound.scheduler.current_snapshot())
    }

    /// Run one tick immediately. `None` until identity bootstrap succeeded.
    pub async fn scan_once(&self) -> Option<TickResult> {
        let scheduler = self.current_view()?.bound.scheduler;
        Some(scheduler.scan_once().await)
    }
}
