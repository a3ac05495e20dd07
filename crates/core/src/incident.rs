use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Incident severity. Its label doubles as the incident's `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Warning => "Warning",
            Severity::Critical => "Critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Store-assigned opaque record id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identity handed out by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An incident produced by evaluation that has not been durably recorded yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentDraft {
    /// Incident type label (e.g. `"waste"`).
    #[serde(rename = "type")]
    pub kind: String,
    pub area: String,
    pub description: String,
    pub status: Severity,
    pub observed_at: DateTime<Utc>,
}

/// Server-assigned persistence time.
///
/// Very recent writes may be delivered before the store has resolved their
/// timestamp; those are `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedAt {
    Resolved(DateTime<Utc>),
    Pending,
}

impl PersistedAt {
    pub fn resolved(&self) -> Option<DateTime<Utc>> {
        match self {
            PersistedAt::Resolved(at) => Some(*at),
            PersistedAt::Pending => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, PersistedAt::Pending)
    }
}

/// A durably stored, immutable incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: RecordId,
    #[serde(flatten)]
    pub draft: IncidentDraft,
    pub persisted_at: PersistedAt,
}

/// Per-principal namespace of the remote incident collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionRef {
    path: String,
}

impl CollectionRef {
    /// `artifacts/{app_id}/users/{principal}/{collection}`.
    pub fn for_principal(app_id: &str, principal: &PrincipalId, collection: &str) -> Self {
        Self {
            path: format!(
                "artifacts/{}/users/{}/{}",
                app_id,
                principal.as_str(),
                collection
            ),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}
