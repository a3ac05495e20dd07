//! Minijinja rendering for incident descriptions.
//!
//! Rule descriptions are arbitrary template strings (not pre-registered), so a
//! fresh [`minijinja::Environment`] is built per render call, as for the
//! notification templates this is modelled on.

use std::fmt;

use serde::Serialize;

use crate::loader::RuleError;

/// Values a description template can reference.
#[derive(Debug, Clone, Serialize)]
pub struct DescriptionContext<'a> {
    pub rule_id: &'a str,
    /// Incident type label.
    pub kind: &'a str,
    pub area: &'a str,
    /// Raw reading in `[0, 1]`.
    pub value: f64,
    /// Reading as a percentage, see [`Percent`].
    pub percent: Percent,
    pub threshold: f64,
    pub threshold_percent: i64,
}

impl<'a> DescriptionContext<'a> {
    pub fn new(rule_id: &'a str, kind: &'a str, area: &'a str, value: f64, threshold: f64) -> Self {
        Self {
            rule_id,
            kind,
            area,
            value,
            percent: Percent::of_reading(value, threshold),
            threshold,
            threshold_percent: to_percent(threshold),
        }
    }
}

/// `0.81` → `81`. Rounds so float noise (`81.00000000000001`) never leaks into text.
pub fn to_percent(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

fn to_tenths(value: f64) -> i64 {
    (value * 1000.0).round() as i64
}

/// A reading rendered as a percentage.
///
/// Whole percent unless rounding would land on or below the threshold of a
/// reading that breached it; then one decimal, at least a tenth above the
/// threshold, so `0.8049` against `0.80` reads `80.5` rather than `80`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Percent {
    Whole(i64),
    Tenths(f64),
}

impl Percent {
    pub fn of_reading(value: f64, threshold: f64) -> Self {
        let whole = to_percent(value);
        if value > threshold && whole <= to_percent(threshold) {
            let tenths = to_tenths(value).max(to_tenths(threshold) + 1);
            Percent::Tenths(tenths as f64 / 10.0)
        } else {
            Percent::Whole(whole)
        }
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Percent::Whole(p) => write!(f, "{}", p),
            Percent::Tenths(p) => write!(f, "{:.1}", p),
        }
    }
}

fn build_env() -> minijinja::Environment<'static> {
    let mut env = minijinja::Environment::new();
    env.add_filter("round", round_filter);
    env.add_filter("pct", pct_filter);
    env
}

/// Render a description template.
pub fn render(template: &str, ctx: &DescriptionContext<'_>) -> Result<String, RuleError> {
    build_env()
        .render_str(template, ctx)
        .map_err(|e| RuleError::Template(e.to_string()))
}

/// Check that a template parses. Does not evaluate it.
pub fn validate(template: &str) -> Result<(), RuleError> {
    let env = build_env();
    env.template_from_str(template)
        .map_err(|e| RuleError::Template(e.to_string()))?;
    Ok(())
}

/// Plain description used when a template cannot be rendered.
pub fn fallback_description(ctx: &DescriptionContext<'_>) -> String {
    format!(
        "{} reading at {}% exceeds the {}% limit in {}.",
        ctx.kind, ctx.percent, ctx.threshold_percent, ctx.area
    )
}

/// Custom filter: round a float to N decimal places.
fn round_filter(value: f64, decimals: Option<u32>) -> String {
    let n = decimals.unwrap_or(0);
    format!("{:.prec$}", value, prec = n as usize)
}

/// Custom filter: fraction to whole percent.
fn pct_filter(value: f64) -> i64 {
    to_percent(value)
}
