//! Overall system status, derived from the scan outcome and feed channels.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::reconciler::FeedView;
use crate::scheduler::{ScanOutcome, ScanVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Initializing,
    WaitingForStore,
    Monitoring,
    FullyCompliant,
    IncidentDetected,
    StoreError,
}

impl SystemStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::WaitingForStore => "Waiting for incident store",
            Self::Monitoring => "Monitoring",
            Self::FullyCompliant => "Fully compliant",
            Self::IncidentDetected => "Incident detected",
            Self::StoreError => "Incident store error",
        }
    }

    /// Pure derivation; first match wins:
    /// store error, not ready, no delivery yet, last scan non-compliant,
    /// last scan compliant, otherwise monitoring.
    pub fn derive(inputs: &StatusInputs) -> Self {
        if inputs.subscription_broken {
            return Self::StoreError;
        }
        if !inputs.ready {
            return Self::Initializing;
        }
        if !inputs.feed_delivered {
            return Self::WaitingForStore;
        }
        match inputs.last_scan {
            Some(ScanVerdict::IncidentsDetected { .. }) => Self::IncidentDetected,
            Some(ScanVerdict::Compliant) => Self::FullyCompliant,
            Some(ScanVerdict::SnapshotRejected) | None => Self::Monitoring,
        }
    }
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusInputs {
    /// Identity acquired and store bound.
    pub ready: bool,
    /// At least one feed delivery was applied.
    pub feed_delivered: bool,
    pub subscription_broken: bool,
    pub last_scan: Option<ScanVerdict>,
}

/// Read side of the channels status is derived from.
#[derive(Debug, Clone)]
pub struct StatusSources {
    scans: watch::Receiver<Option<ScanOutcome>>,
    feed: watch::Receiver<FeedView>,
}

impl StatusSources {
    pub fn new(scans: watch::Receiver<Option<ScanOutcome>>, feed: watch::Receiver<FeedView>) -> Self {
        Self { scans, feed }
    }

    pub fn inputs(&self) -> StatusInputs {
        let last_scan = self.scans.borrow().as_ref().map(|o| o.verdict);
        let feed = self.feed.borrow();
        StatusInputs {
            ready: true,
            feed_delivered: feed.deliveries > 0,
            subscription_broken: feed.connection.is_broken(),
            last_scan,
        }
    }

    pub fn current(&self) -> SystemStatus {
        SystemStatus::derive(&self.inputs())
    }
}

/// Recomputes status whenever an input channel changes.
///
/// The status sender is shared so a restarted monitor keeps its receivers,
/// but only one aggregator runs at a time and it is the only writer.
pub struct StatusAggregator {
    sources: StatusSources,
    tx: Arc<watch::Sender<SystemStatus>>,
}

impl StatusAggregator {
    pub fn new(sources: StatusSources, tx: Arc<watch::Sender<SystemStatus>>) -> Self {
        Self { sources, tx }
    }

    /// Publish the current status if it changed. Returns it either way.
    pub fn recompute(&self) -> SystemStatus {
        let next = self.sources.current();
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = %current, to = %next, "system status changed");
            *current = next;
            true
        });
        next
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.recompute();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Ok(()) = self.sources.scans.changed() => {}
                Ok(()) = self.sources.feed.changed() => {}
                else => break,
            }
            self.recompute();
        }
        debug!("status aggregator stopped");
    }
}
