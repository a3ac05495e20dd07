//! Sensor stand-in: each reading drifts by a bounded random step per tick.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use civicwatch_core::config::{DriftBounds, MonitorConfig};
use civicwatch_core::{clamp01, Metric, MetricSnapshot, Result};

/// Supplies the per-tick step for one metric.
pub trait PerturbationSource: Send {
    fn sample(&mut self, metric: Metric, bounds: DriftBounds) -> f64;
}

/// Uniform steps within the configured bounds.
pub struct RandomPerturbation {
    rng: StdRng,
}

impl RandomPerturbation {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl PerturbationSource for RandomPerturbation {
    fn sample(&mut self, _metric: Metric, bounds: DriftBounds) -> f64 {
        if bounds.min >= bounds.max {
            return bounds.min;
        }
        self.rng.gen_range(bounds.min..=bounds.max)
    }
}

/// Fixed steps, consumed in order per metric; `0.0` once exhausted.
/// Bounds are ignored.
#[derive(Debug, Default)]
pub struct ScriptedPerturbation {
    waste: VecDeque<f64>,
    traffic: VecDeque<f64>,
}

impl ScriptedPerturbation {
    pub fn new(waste: impl IntoIterator<Item = f64>, traffic: impl IntoIterator<Item = f64>) -> Self {
        Self {
            waste: waste.into_iter().collect(),
            traffic: traffic.into_iter().collect(),
        }
    }
}

impl PerturbationSource for ScriptedPerturbation {
    fn sample(&mut self, metric: Metric, _bounds: DriftBounds) -> f64 {
        let queue = match metric {
            Metric::WasteVolume => &mut self.waste,
            Metric::TrafficDensity => &mut self.traffic,
        };
        queue.pop_front().unwrap_or(0.0)
    }
}

pub struct MetricSimulator {
    waste_drift: DriftBounds,
    traffic_drift: DriftBounds,
    source: Box<dyn PerturbationSource>,
}

impl MetricSimulator {
    pub fn new(
        waste_drift: DriftBounds,
        traffic_drift: DriftBounds,
        source: Box<dyn PerturbationSource>,
    ) -> Self {
        Self {
            waste_drift,
            traffic_drift,
            source,
        }
    }

    /// Random simulator from config; seeded when `config.seed` is set.
    pub fn from_config(config: &MonitorConfig) -> Self {
        let source: Box<dyn PerturbationSource> = match config.seed {
            Some(seed) => Box::new(RandomPerturbation::seeded(seed)),
            None => Box::new(RandomPerturbation::from_entropy()),
        };
        Self::with_source(config, source)
    }

    pub fn with_source(config: &MonitorConfig, source: Box<dyn PerturbationSource>) -> Self {
        Self::new(config.waste_drift, config.traffic_drift, source)
    }

    /// Next snapshot: `clamp01(prev + step)` per metric.
    ///
    /// Fails with `MalformedSnapshot` only if the source hands back a
    /// non-finite step; the result must then not be evaluated.
    pub fn next(&mut self, prev: &MetricSnapshot, observed_at: DateTime<Utc>) -> Result<MetricSnapshot> {
        let waste = clamp01(
            prev.waste_volume() + self.source.sample(Metric::WasteVolume, self.waste_drift),
        );
        let traffic = clamp01(
            prev.traffic_density() + self.source.sample(Metric::TrafficDensity, self.traffic_drift),
        );
        MetricSnapshot::new(waste, traffic, observed_at)
    }
}
