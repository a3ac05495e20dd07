//! Periodic compliance scans.
//!
//! A tick takes the next simulated snapshot, evaluates it against the rule
//! catalog and appends one record per fired rule. Ticks never overlap: the
//! configured [`OverlapPolicy`](civicwatch_core::config::OverlapPolicy)
//! decides whether a tick that finds one in flight is dropped or queued.

pub mod metrics;
pub mod runner;
pub mod types;

pub use metrics::ScanMetrics;
pub use runner::ScanScheduler;
pub use types::{ScanOutcome, ScanVerdict, TickResult};
