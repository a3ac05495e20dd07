//! Integration tests that verify the shipped catalog in `data/rules/`
//! loads and behaves like the built-in reference catalog.

use chrono::Utc;

use civicwatch_core::MetricSnapshot;
use civicwatch_rules::{ComplianceEvaluator, RuleCatalog};

/// Integration tests run from the crate directory, so we go up two levels.
fn rules_dir() -> std::path::PathBuf {
    let manifest = std::path::Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest.join("../../data/rules")
}

fn load(filename: &str) -> RuleCatalog {
    let path = rules_dir().join(filename);
    RuleCatalog::load(&path).unwrap_or_else(|e| panic!("Failed to load {}: {}", path.display(), e))
}

#[test]
fn reference_file_matches_builtin_catalog() {
    let from_file = load("reference.yml");
    let builtin = RuleCatalog::reference();

    let file_rules: Vec<_> = from_file.iter().cloned().collect();
    let builtin_rules: Vec<_> = builtin.iter().cloned().collect();
    assert_eq!(file_rules.len(), builtin_rules.len());
    for (a, b) in file_rules.iter().zip(&builtin_rules) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.metric, b.metric);
        assert_eq!(a.threshold, b.threshold);
        assert_eq!(a.severity, b.severity);
    }
}

#[test]
fn reference_file_produces_same_descriptions() {
    let from_file = load("reference.yml");
    let builtin = RuleCatalog::reference();
    let snapshot = MetricSnapshot::new(0.87, 0.91, Utc::now()).unwrap();

    let a = ComplianceEvaluator::evaluate(&snapshot, &from_file);
    let b = ComplianceEvaluator::evaluate(&snapshot, &builtin);
    assert_eq!(a, b);
    assert_eq!(
        a.drafts[0].description,
        "Waste container volume at 87% exceeds the 80% capacity limit."
    );
}
