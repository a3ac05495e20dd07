use chrono::{DateTime, Utc};
use serde::Serialize;

use civicwatch_core::{MetricSnapshot, RecordId};

/// What a finished tick concluded about its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ScanVerdict {
    Compliant,
    IncidentsDetected { drafts: usize },
    /// The simulator produced a malformed snapshot; nothing was evaluated.
    SnapshotRejected,
}

impl ScanVerdict {
    pub fn is_compliant(&self) -> bool {
        matches!(self, Self::Compliant)
    }
}

/// Result of one completed tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanOutcome {
    /// 1-based tick number.
    pub tick: u64,
    /// `None` when the snapshot was rejected.
    pub snapshot: Option<MetricSnapshot>,
    pub verdict: ScanVerdict,
    /// Ids of records appended this tick, in catalog order.
    pub appended: Vec<RecordId>,
    /// Set when an append failed; remaining drafts of the tick were abandoned.
    pub write_error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ScanOutcome {
    /// Drafts that fired but were not persisted.
    pub fn abandoned(&self) -> usize {
        match self.verdict {
            ScanVerdict::IncidentsDetected { drafts } => drafts.saturating_sub(self.appended.len()),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickResult {
    Ran(ScanOutcome),
    /// A tick was already in flight (or queued) and this one was dropped.
    Skipped,
}

impl TickResult {
    pub fn outcome(&self) -> Option<&ScanOutcome> {
        match self {
            Self::Ran(outcome) => Some(outcome),
            Self::Skipped => None,
        }
    }
}
