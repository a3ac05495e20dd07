//! Compliance rule engine.
//!
//! This crate provides:
//! - [`RuleCatalog`]: the immutable, ordered set of compliance rules
//! - YAML catalog loading with validation
//! - Minijinja rendering of incident descriptions
//! - [`ComplianceEvaluator`]: snapshot → compliance verdict + incident drafts

pub mod catalog;
pub mod evaluator;
pub mod loader;
pub mod templates;

pub use catalog::{Rule, RuleCatalog};
pub use evaluator::{ComplianceEvaluator, Evaluation};
pub use loader::{Result, RuleError};
