use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CivicError, Result};

/// Metric selector: which reading of a [`MetricSnapshot`] a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    WasteVolume,
    TrafficDensity,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::WasteVolume, Metric::TrafficDensity];

    /// Read this metric from a snapshot.
    pub fn read(&self, snapshot: &MetricSnapshot) -> f64 {
        match self {
            Metric::WasteVolume => snapshot.waste_volume,
            Metric::TrafficDensity => snapshot.traffic_density,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::WasteVolume => "waste_volume",
            Metric::TrafficDensity => "traffic_density",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waste_volume" => Ok(Metric::WasteVolume),
            "traffic_density" => Ok(Metric::TrafficDensity),
            other => Err(format!("unknown metric: '{}'", other)),
        }
    }
}

/// One timestamped set of metric readings.
///
/// Fields are private: the only way to build a snapshot is [`MetricSnapshot::new`],
/// which rejects readings that are not finite or fall outside `[0, 1]`. Anything
/// holding a `MetricSnapshot` can therefore hand it to the evaluator unchecked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSnapshot {
    waste_volume: f64,
    traffic_density: f64,
    observed_at: DateTime<Utc>,
}

impl MetricSnapshot {
    pub fn new(
        waste_volume: f64,
        traffic_density: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<Self> {
        check_unit(Metric::WasteVolume, waste_volume)?;
        check_unit(Metric::TrafficDensity, traffic_density)?;
        Ok(Self {
            waste_volume,
            traffic_density,
            observed_at,
        })
    }

    pub fn waste_volume(&self) -> f64 {
        self.waste_volume
    }

    pub fn traffic_density(&self) -> f64 {
        self.traffic_density
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

fn check_unit(metric: Metric, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CivicError::MalformedSnapshot { metric, value })
    }
}

/// Clamp a reading into `[0, 1]`. NaN stays NaN so the snapshot constructor rejects it.
pub fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
