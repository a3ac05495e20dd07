use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{ScanOutcome, ScanVerdict};

/// Scan loop counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanMetrics {
    /// Ticks that ran to completion (including rejected snapshots).
    pub ticks_run: u64,
    /// Ticks dropped because another was in flight.
    pub ticks_skipped: u64,
    pub snapshots_rejected: u64,
    pub drafts_emitted: u64,
    pub records_appended: u64,
    pub append_failures: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick_duration: Option<Duration>,
    /// Rolling mean over all completed ticks.
    pub avg_tick_duration: Duration,
}

impl ScanMetrics {
    pub fn record_outcome(&mut self, outcome: &ScanOutcome, duration: Duration) {
        self.ticks_run += 1;
        match outcome.verdict {
            ScanVerdict::SnapshotRejected => self.snapshots_rejected += 1,
            ScanVerdict::IncidentsDetected { drafts } => self.drafts_emitted += drafts as u64,
            ScanVerdict::Compliant => {}
        }
        self.records_appended += outcome.appended.len() as u64;
        if outcome.write_error.is_some() {
            self.append_failures += 1;
        }
        self.last_tick_at = Some(outcome.finished_at);
        self.last_tick_duration = Some(duration);

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let prev = self.avg_tick_duration.as_nanos() as f64;
        let cur = duration.as_nanos() as f64;
        let avg = prev + (cur - prev) / self.ticks_run as f64;
        self.avg_tick_duration = Duration::from_nanos(avg as u64);
    }

    pub fn record_skip(&mut self) {
        self.ticks_skipped += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicwatch_core::RecordId;

    fn outcome(verdict: ScanVerdict, appended: usize, failed: bool) -> ScanOutcome {
        ScanOutcome {
            tick: 1,
            snapshot: None,
            verdict,
            appended: (0..appended).map(|i| RecordId(format!("r{}", i))).collect(),
            write_error: failed.then(|| "boom".to_string()),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn counts_accumulate() {
        let mut m = ScanMetrics::default();
        m.record_outcome(&outcome(ScanVerdict::Compliant, 0, false), Duration::from_millis(10));
        m.record_outcome(
            &outcome(ScanVerdict::IncidentsDetected { drafts: 2 }, 1, true),
            Duration::from_millis(30),
        );
        m.record_outcome(&outcome(ScanVerdict::SnapshotRejected, 0, false), Duration::from_millis(20));
        m.record_skip();

        assert_eq!(m.ticks_run, 3);
        assert_eq!(m.ticks_skipped, 1);
        assert_eq!(m.snapshots_rejected, 1);
        assert_eq!(m.drafts_emitted, 2);
        assert_eq!(m.records_appended, 1);
        assert_eq!(m.append_failures, 1);
        assert_eq!(m.last_tick_duration, Some(Duration::from_millis(20)));
        assert_eq!(m.avg_tick_duration, Duration::from_millis(20));
    }

    #[test]
    fn abandoned_drafts() {
        let o = outcome(ScanVerdict::IncidentsDetected { drafts: 3 }, 1, true);
        assert_eq!(o.abandoned(), 2);
        assert_eq!(outcome(ScanVerdict::Compliant, 0, false).abandoned(), 0);
    }
}
