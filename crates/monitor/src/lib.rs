//! Compliance monitoring loop.
//!
//! This crate provides:
//! - [`MetricSimulator`]: bounded random walk standing in for the sensors
//! - [`ScanScheduler`]: periodic scan → evaluate → append, serialized per tick
//! - [`IncidentFeedReconciler`]: live feed → atomically replaced, time-ordered view
//! - [`SystemStatus`] derivation and the [`StatusAggregator`] task
//! - [`ComplianceMonitor`]: wires identity, store, scheduler and reconciler together

pub mod binding;
pub mod monitor;
pub mod reconciler;
pub mod scheduler;
pub mod simulator;
pub mod status;

pub use binding::StoreBinding;
pub use monitor::ComplianceMonitor;
pub use reconciler::{reconcile, FeedConnection, FeedView, IncidentFeedReconciler, ReconciledFeed, ReconciledIncident};
pub use scheduler::{ScanMetrics, ScanOutcome, ScanScheduler, ScanVerdict, TickResult};
pub use simulator::{MetricSimulator, PerturbationSource, RandomPerturbation, ScriptedPerturbation};
pub use status::{StatusAggregator, StatusInputs, StatusSources, SystemStatus};
