//! Snapshot evaluation against the rule catalog.
//!
//! The evaluator is a pure function of its inputs: no clock, no randomness,
//! no state between calls. A [`MetricSnapshot`] can only exist with readings
//! in `[0, 1]`, so malformed input is rejected before it gets here.

use tracing::{debug, warn};

use civicwatch_core::{IncidentDraft, MetricSnapshot};

use crate::catalog::{Rule, RuleCatalog};
use crate::templates::{self, DescriptionContext};

/// Outcome of evaluating one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// True iff no rule fired.
    pub is_compliant: bool,
    /// One draft per fired rule, in catalog order.
    pub drafts: Vec<IncidentDraft>,
}

pub struct ComplianceEvaluator;

impl ComplianceEvaluator {
    /// Evaluate every rule against the snapshot. Never fails.
    pub fn evaluate(snapshot: &MetricSnapshot, catalog: &RuleCatalog) -> Evaluation {
        let drafts: Vec<IncidentDraft> = catalog
            .iter()
            .filter_map(|rule| Self::evaluate_rule(rule, snapshot))
            .collect();

        debug!(
            waste_volume = snapshot.waste_volume(),
            traffic_density = snapshot.traffic_density(),
            fired = drafts.len(),
            "snapshot evaluated"
        );

        Evaluation {
            is_compliant: drafts.is_empty(),
            drafts,
        }
    }

    fn evaluate_rule(rule: &Rule, snapshot: &MetricSnapshot) -> Option<IncidentDraft> {
        let value = rule.metric.read(snapshot);
        if value <= rule.threshold {
            return None;
        }

        let ctx = DescriptionContext::new(&rule.id, &rule.kind, &rule.area, value, rule.threshold);
        let description = match templates::render(&rule.description, &ctx) {
            Ok(text) => text,
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "description render failed, using fallback");
                templates::fallback_description(&ctx)
            }
        };

        Some(IncidentDraft {
            kind: rule.kind.clone(),
            area: rule.area.clone(),
            description,
            status: rule.severity,
            observed_at: snapshot.observed_at(),
        })
    }
}
