use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CivicError, Result};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

/// Explicit configuration handed to the monitor at construction.
///
/// Nothing below the binary reads the environment; `from_env` and
/// `from_file` exist for the process edge only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub monitor: MonitorConfig,
    pub store: StoreConfig,
    pub identity: IdentityConfig,
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CIVICWATCH_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CIVICWATCH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            monitor: MonitorConfig::from_env_profiled(p),
            store: StoreConfig::from_env_profiled(p),
            identity: IdentityConfig::from_env_profiled(p),
            reconnect: ReconnectConfig::from_env_profiled(p),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject configurations the monitor cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.monitor.validate()?;
        self.store.validate()?;
        self.identity.validate()?;
        self.reconnect.validate()
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  monitor:     period={}ms, overlap={}, seed={}",
            self.monitor.scan_period_ms,
            self.monitor.overlap_policy,
            self.monitor
                .seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "(entropy)".into())
        );
        tracing::info!(
            "  drift:       waste=[{}, {}], traffic=[{}, {}]",
            self.monitor.waste_drift.min,
            self.monitor.waste_drift.max,
            self.monitor.traffic_drift.min,
            self.monitor.traffic_drift.max
        );
        tracing::info!(
            "  store:       app_id={}, collection={}",
            self.store.app_id,
            self.store.collection
        );
        tracing::info!(
            "  identity:    token={}, timeout={}s",
            if self.identity.auth_token.is_some() { "set" } else { "(anonymous)" },
            self.identity.timeout_secs
        );
        tracing::info!(
            "  reconnect:   initial={}ms, max={}ms, attempts={}",
            self.reconnect.initial_backoff_ms,
            self.reconnect.max_backoff_ms,
            self.reconnect.max_attempts
        );
    }

    /// Return a redacted view safe for status output (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "monitor": {
                "scan_period_ms": self.monitor.scan_period_ms,
                "overlap_policy": self.monitor.overlap_policy,
                "initial_waste_volume": self.monitor.initial_waste_volume,
                "initial_traffic_density": self.monitor.initial_traffic_density,
            },
            "store": { "app_id": self.store.app_id, "collection": self.store.collection },
            "identity": {
                "token_configured": self.identity.auth_token.is_some(),
                "timeout_secs": self.identity.timeout_secs,
            },
            "reconnect": {
                "initial_backoff_ms": self.reconnect.initial_backoff_ms,
                "max_backoff_ms": self.reconnect.max_backoff_ms,
                "max_attempts": self.reconnect.max_attempts,
            },
        })
    }
}

fn invalid(msg: impl Into<String>) -> CivicError {
    CivicError::Configuration(msg.into())
}

// ── Monitor ───────────────────────────────────────────────────

/// What the scheduler does with a tick that fires while the previous
/// tick's append sequence is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Drop the overlapping tick.
    #[default]
    Skip,
    /// Let one tick wait for the running one; further overlaps are dropped.
    Queue,
}

impl fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlapPolicy::Skip => write!(f, "skip"),
            OverlapPolicy::Queue => write!(f, "queue"),
        }
    }
}

impl FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(OverlapPolicy::Skip),
            "queue" => Ok(OverlapPolicy::Queue),
            other => Err(format!("unknown overlap policy: '{}'", other)),
        }
    }
}

/// Per-tick perturbation range `[min, max]` for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftBounds {
    pub min: f64,
    pub max: f64,
}

impl DriftBounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(invalid(format!("{} drift bounds must be finite", name)));
        }
        if self.min > self.max {
            return Err(invalid(format!(
                "{} drift min ({}) exceeds max ({})",
                name, self.min, self.max
            )));
        }
        if self.min < -1.0 || self.max > 1.0 {
            return Err(invalid(format!("{} drift bounds must lie within [-1, 1]", name)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub scan_period_ms: u64,
    pub overlap_policy: OverlapPolicy,
    /// Waste volume grows faster than it falls so incidents keep occurring.
    pub waste_drift: DriftBounds,
    pub traffic_drift: DriftBounds,
    pub initial_waste_volume: f64,
    pub initial_traffic_density: f64,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_period_ms: 4_000,
            overlap_policy: OverlapPolicy::Skip,
            waste_drift: DriftBounds::new(-0.03, 0.06),
            traffic_drift: DriftBounds::new(-0.05, 0.05),
            initial_waste_volume: 0.5,
            initial_traffic_density: 0.4,
            seed: None,
        }
    }
}

impl MonitorConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            scan_period_ms: profiled_env_parse(p, "SCAN_PERIOD_MS", d.scan_period_ms),
            overlap_policy: profiled_env_parse(p, "OVERLAP_POLICY", d.overlap_policy),
            waste_drift: DriftBounds::new(
                profiled_env_parse(p, "WASTE_DRIFT_MIN", d.waste_drift.min),
                profiled_env_parse(p, "WASTE_DRIFT_MAX", d.waste_drift.max),
            ),
            traffic_drift: DriftBounds::new(
                profiled_env_parse(p, "TRAFFIC_DRIFT_MIN", d.traffic_drift.min),
                profiled_env_parse(p, "TRAFFIC_DRIFT_MAX", d.traffic_drift.max),
            ),
            initial_waste_volume: profiled_env_parse(p, "INITIAL_WASTE_VOLUME", d.initial_waste_volume),
            initial_traffic_density: profiled_env_parse(
                p,
                "INITIAL_TRAFFIC_DENSITY",
                d.initial_traffic_density,
            ),
            seed: profiled_env_opt(p, "SIMULATOR_SEED").and_then(|v| v.parse().ok()),
        }
    }

    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.scan_period_ms == 0 {
            return Err(invalid("scan period must be greater than zero"));
        }
        self.waste_drift.validate("waste")?;
        self.traffic_drift.validate("traffic")?;
        for (name, v) in [
            ("initial waste volume", self.initial_waste_volume),
            ("initial traffic density", self.initial_traffic_density),
        ] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(invalid(format!("{} must lie within [0, 1], got {}", name, v)));
            }
        }
        Ok(())
    }
}

// ── Store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Application namespace in the remote store.
    pub app_id: String,
    /// Name of the per-principal incident collection.
    pub collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            app_id: "default-app-id".into(),
            collection: "incidents".into(),
        }
    }
}

impl StoreConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            app_id: profiled_env_or(p, "APP_ID", &d.app_id),
            collection: profiled_env_or(p, "INCIDENT_COLLECTION", &d.collection),
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, v) in [("app_id", &self.app_id), ("collection", &self.collection)] {
            if v.trim().is_empty() {
                return Err(invalid(format!("store {} must not be empty", name)));
            }
            if v.contains('/') {
                return Err(invalid(format!("store {} must not contain '/': {}", name, v)));
            }
        }
        Ok(())
    }
}

// ── Identity ──────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Token for token-based sign-in. Anonymous sign-in when absent.
    pub auth_token: Option<String>,
    /// Upper bound on identity acquisition.
    pub timeout_secs: u64,
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            timeout_secs: 30,
        }
    }
}

impl IdentityConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            auth_token: profiled_env_opt(p, "INITIAL_AUTH_TOKEN"),
            timeout_secs: profiled_env_parse(p, "IDENTITY_TIMEOUT_SECS", d.timeout_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(invalid("identity timeout must be greater than zero"));
        }
        Ok(())
    }
}

// ── Reconnect ─────────────────────────────────────────────────

/// Backoff policy for re-subscribing after the live feed breaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 0 disables reconnects: the feed stays broken until restart.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            initial_backoff_ms: profiled_env_parse(p, "RECONNECT_INITIAL_MS", d.initial_backoff_ms),
            max_backoff_ms: profiled_env_parse(p, "RECONNECT_MAX_MS", d.max_backoff_ms),
            max_attempts: profiled_env_parse(p, "RECONNECT_MAX_ATTEMPTS", d.max_attempts),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), doubling up to the cap.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts > 0 && self.initial_backoff_ms == 0 {
            return Err(invalid("reconnect initial backoff must be greater than zero"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(invalid(format!(
                "reconnect initial backoff ({}ms) exceeds max ({}ms)",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.monitor.scan_period(), Duration::from_secs(4));
        assert_eq!(config.store.app_id, "default-app-id");
        assert_eq!(config.profile_label(), "default");
    }

    #[test]
    fn zero_period_is_configuration_error() {
        let mut config = Config::default();
        config.monitor.scan_period_ms = 0;
        assert!(matches!(config.validate(), Err(CivicError::Configuration(_))));
    }

    #[test]
    fn inverted_drift_bounds_rejected() {
        let mut config = Config::default();
        config.monitor.waste_drift = DriftBounds::new(0.1, -0.1);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("waste drift"));
    }

    #[test]
    fn slash_in_app_id_rejected() {
        let mut config = Config::default();
        config.store.app_id = "a/b".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
[monitor]
scan_period_ms = 500
overlap_policy = "queue"

[store]
app_id = "city-hall"
"#,
        )
        .unwrap();
        assert_eq!(config.monitor.scan_period_ms, 500);
        assert_eq!(config.monitor.overlap_policy, OverlapPolicy::Queue);
        assert_eq!(config.monitor.waste_drift, DriftBounds::new(-0.03, 0.06));
        assert_eq!(config.store.app_id, "city-hall");
        assert_eq!(config.store.collection, "incidents");
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[identity]\ntimeout_secs = 7").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.identity.timeout(), Duration::from_secs(7));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml_str("[monitor\nscan_period_ms = ").unwrap_err();
        assert!(matches!(err, CivicError::TomlParse(_)));
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let r = ReconnectConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            max_attempts: 10,
        };
        assert_eq!(r.backoff_for(1), Duration::from_millis(100));
        assert_eq!(r.backoff_for(2), Duration::from_millis(200));
        assert_eq!(r.backoff_for(4), Duration::from_millis(800));
        assert_eq!(r.backoff_for(5), Duration::from_millis(1_000));
        assert_eq!(r.backoff_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn overlap_policy_parses_case_insensitively() {
        assert_eq!("QUEUE".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Queue);
        assert!("drop".parse::<OverlapPolicy>().is_err());
    }

    #[test]
    fn debug_output_redacts_token() {
        let identity = IdentityConfig {
            auth_token: Some("secret-token".into()),
            timeout_secs: 5,
        };
        let rendered = format!("{:?}", identity);
        assert!(!rendered.contains("secret-token"));

        let mut config = Config::default();
        config.identity = identity;
        let summary = config.redacted_summary().to_string();
        assert!(!summary.contains("secret-token"));
        assert!(summary.contains("token_configured"));
    }
}
