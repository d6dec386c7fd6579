//! Friction events and gap diagnoses.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{FrictionId, ProjectId, TypeDefId, UnitId};
use crate::operation::TypeOperation;
use crate::taxonomy::default_schema_version;

/// Which mechanical signal the oracle judged to be friction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    UncategorizedUsage,
    TypeNameOverride,
    FieldOverlap,
    BimodalContent,
    Dormancy,
}

/// Oracle-supplied severity. Never compared against a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrictionStatus {
    Detected,
    Diagnosing,
    Resolved,
    Deferred,
}

/// Pointer to the evidence that triggered a friction event: the package
/// digest plus the type slice the oracle looked at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub package_digest: String,
    pub type_id: TypeDefId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrictionEvent {
    pub id: FrictionId,
    pub project_id: ProjectId,
    pub signal_type: SignalType,
    pub evidence_ref: EvidenceRef,
    /// Bounded payload the oracle judged; kept so decisions can show their
    /// triggering evidence without re-deriving it.
    #[serde(default)]
    pub evidence: Value,
    pub severity: Severity,
    pub affected_type_id: TypeDefId,
    pub status: FrictionStatus,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

/// Closed set of gap kinds a friction event can be diagnosed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    MissingConcept,
    WrongConcept,
    VagueConcept,
    MissingTension,
    FalseTension,
    MisweightedTension,
    MissingAgentModel,
    WrongAgentModel,
    MissingInstrument,
    IneffectiveInstrument,
    MissingType,
    CrossReferenceNeeded,
}

/// Request to coin a new unit, produced when a gap is best closed by content
/// rather than by changing the taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinRequest {
    pub type_id: TypeDefId,
    pub domain: String,
    #[serde(default)]
    pub seed_fields: IndexMap<String, Value>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecommendedAction {
    TypeOperation { operation: Box<TypeOperation> },
    Coin { request: CoinRequest },
    ReviseUnit { unit_id: UnitId, note: String },
    NoAction { reason: String },
}

impl RecommendedAction {
    pub fn operation(&self) -> Option<&TypeOperation> {
        match self {
            Self::TypeOperation { operation } => Some(operation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapDiagnosis {
    pub friction_id: FrictionId,
    pub project_id: ProjectId,
    pub gap_kind: GapKind,
    pub rationale: String,
    pub recommended_action: RecommendedAction,
    pub diagnosed_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Moderate);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_rejects_unknown_values() {
        let parsed: Result<Severity, _> = serde_json::from_str("\"catastrophic\"");
        assert!(parsed.is_err());
        let parsed: Severity = serde_json::from_str("\"moderate\"").unwrap();
        assert_eq!(parsed, Severity::Moderate);
    }

    #[test]
    fn no_action_carries_reason() {
        let action = RecommendedAction::NoAction {
            reason: "universal types cannot be split".into(),
        };
        assert!(action.operation().is_none());
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"action\":\"no_action\""));
    }
}
