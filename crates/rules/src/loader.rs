//! Catalog file loading and rule error types.
//!
//! A catalog file is a single YAML document:
//!
//! ```yaml
//! apiVersion: v1
//! kind: RuleCatalog
//! rules:
//!   - id: waste-volume-over-capacity
//!     type: waste
//!     metric: waste_volume
//!     threshold: 0.8
//!     area: Sector 7 Waste Collection
//!     severity: Warning
//!     description: "Waste container volume at {{ percent }}% ..."
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::catalog::{Rule, RuleCatalog};

/// Errors that can occur while building a rule catalog.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// Filesystem I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse/deserialization error.
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Rule validation error (duplicate ids, out-of-range thresholds, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Description template failed to parse or render.
    #[error("Template error: {0}")]
    Template(String),
}

/// Result alias for rule operations.
pub type Result<T> = std::result::Result<T, RuleError>;

const SUPPORTED_API_VERSION: &str = "v1";
const CATALOG_KIND: &str = "RuleCatalog";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    api_version: String,
    kind: String,
    rules: Vec<Rule>,
}

impl RuleCatalog {
    /// Parse and validate a catalog from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml)?;
        if file.api_version != SUPPORTED_API_VERSION {
            return Err(RuleError::Validation(format!(
                "unsupported apiVersion '{}' (expected '{}')",
                file.api_version, SUPPORTED_API_VERSION
            )));
        }
        if file.kind != CATALOG_KIND {
            return Err(RuleError::Validation(format!(
                "unexpected kind '{}' (expected '{}')",
                file.kind, CATALOG_KIND
            )));
        }
        RuleCatalog::new(file.rules)
    }

    /// Load and validate a catalog file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        let catalog = Self::from_yaml_str(&yaml)?;
        info!(path = %path.display(), rules = catalog.len(), "rule catalog loaded");
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civicwatch_core::{Metric, Severity};
    use std::io::Write;

    const CATALOG: &str = r#"
apiVersion: v1
kind: RuleCatalog
rules:
  - id: noise-over-limit
    type: traffic
    metric: traffic_density
    threshold: 0.6
    area: Harbour Road
    severity: Critical
    description: "Density {{ percent }}%"
  - id: bins-full
    type: waste
    metric: waste_volume
    threshold: 0.9
    area: Market Square
    severity: Warning
    description: "Bins at {{ percent }}%"
"#;

    #[test]
    fn parses_rules_in_file_order() {
        let catalog = RuleCatalog::from_yaml_str(CATALOG).unwrap();
        let ids: Vec<&str> = catalog.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["noise-over-limit", "bins-full"]);

        let first = catalog.get("noise-over-limit").unwrap();
        assert_eq!(first.metric, Metric::TrafficDensity);
        assert_eq!(first.severity, Severity::Critical);
        assert_eq!(first.kind, "traffic");
    }

    #[test]
    fn wrong_kind_rejected() {
        let yaml = CATALOG.replace("kind: RuleCatalog", "kind: AnomalyRule");
        let err = RuleCatalog::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, RuleError::Validation(_)));
    }

    #[test]
    fn wrong_api_version_rejected() {
        let yaml = CATALOG.replace("apiVersion: v1", "apiVersion: v2");
        assert!(matches!(
            RuleCatalog::from_yaml_str(&yaml),
            Err(RuleError::Validation(_))
        ));
    }

    #[test]
    fn unknown_metric_is_parse_error() {
        let yaml = CATALOG.replace("metric: waste_volume", "metric: noise_level");
        assert!(matches!(
            RuleCatalog::from_yaml_str(&yaml),
            Err(RuleError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();
        let catalog = RuleCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuleCatalog::load(dir.path().join("absent.yml")).unwrap_err();
        assert!(matches!(err, RuleError::Io(_)));
    }
}
