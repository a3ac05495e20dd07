//! The immutable compliance rule set.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use civicwatch_core::{Metric, Severity};

use crate::loader::{Result, RuleError};
use crate::templates;

/// A single compliance rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    /// Incident type label copied onto every draft this rule produces.
    #[serde(rename = "type")]
    pub kind: String,
    /// Which snapshot reading the rule looks at.
    pub metric: Metric,
    /// The rule fires when the reading is strictly greater than this.
    pub threshold: f64,
    pub area: String,
    pub severity: Severity,
    /// Minijinja template, see [`templates::DescriptionContext`].
    pub description: String,
}

/// Fixed, ordered set of rules indexed by id. No mutation API.
#[derive(Debug, Clone)]
pub struct RuleCatalog {
    rules: Vec<Rule>,
    index: HashMap<String, usize>,
}

impl RuleCatalog {
    /// Build a catalog, validating every rule. Iteration order is the input order.
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            validate_rule(rule)?;
            if !seen.insert(rule.id.as_str()) {
                return Err(RuleError::Validation(format!("duplicate rule id '{}'", rule.id)));
            }
        }
        let index = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Ok(Self { rules, index })
    }

    /// The two reference-domain rules: bins over capacity and critical traffic.
    pub fn reference() -> Self {
        let rules = vec![
            Rule {
                id: "waste-volume-over-capacity".into(),
                kind: "waste".into(),
                metric: Metric::WasteVolume,
                threshold: 0.80,
                area: "Sector 7 Waste Collection".into(),
                severity: Severity::Warning,
                description: "Waste container volume at {{ percent }}% exceeds the \
                              {{ threshold_percent }}% capacity limit."
                    .into(),
            },
            Rule {
                id: "traffic-density-critical".into(),
                kind: "traffic".into(),
                metric: Metric::TrafficDensity,
                threshold: 0.75,
                area: "Main Street Corridor".into(),
                severity: Severity::Critical,
                description: "Traffic density at {{ percent }}% is above the \
                              {{ threshold_percent }}% critical level."
                    .into(),
            },
        ];
        let index = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self { rules, index }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.index.get(id).map(|&i| &self.rules[i])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleCatalog {
    fn default() -> Self {
        Self::reference()
    }
}

fn validate_rule(rule: &Rule) -> Result<()> {
    if rule.id.trim().is_empty() {
        return Err(RuleError::Validation("rule id must not be empty".into()));
    }
    if rule.kind.trim().is_empty() {
        return Err(RuleError::Validation(format!("rule '{}': type must not be empty", rule.id)));
    }
    if rule.area.trim().is_empty() {
        return Err(RuleError::Validation(format!("rule '{}': area must not be empty", rule.id)));
    }
    if !rule.threshold.is_finite() || !(0.0..=1.0).contains(&rule.threshold) {
        return Err(RuleError::Validation(format!(
            "rule '{}': threshold {} outside [0, 1]",
            rule.id, rule.threshold
        )));
    }
    templates::validate(&rule.description).map_err(|e| {
        RuleError::Validation(format!("rule '{}': bad description template: {}", rule.id, e))
    })
}
