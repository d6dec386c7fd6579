//! Oracle ("Judge") contract, version 1.
//!
//! Every qualitative call the engine needs goes through [`JudgeRequest`] /
//! [`JudgeReply`]. Grades are enums; nothing in the engine compares them to a
//! number. Replies are validated for shape before use.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{TaxonError, TaxonResult};
use crate::friction::{GapKind, Severity, SignalType};
use crate::ids::{ProjectId, TypeDefId, UnitId};
use crate::operation::{Disposition, OperationKind};
use crate::promotion::TestDimension;

pub const JUDGE_CONTRACT_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssessmentKind {
    Friction,
    Diagnosis,
    Routing,
    Test { dimension: TestDimension },
    Abstraction,
    Duplication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeVerdict {
    Affirmed,
    Rejected,
    Undetermined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scale", content = "value", rename_all = "snake_case")]
pub enum Grade {
    Severity(Severity),
    Confidence(Confidence),
}

/// Operation sketch as the oracle proposes it. The diagnoser turns this into
/// a concrete [`crate::operation::TypeOperation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedOperation {
    pub kind: OperationKind,
    #[serde(default)]
    pub source_type_ids: Vec<TypeDefId>,
    /// Existing target types (merge survivor).
    #[serde(default)]
    pub target_type_ids: Vec<TypeDefId>,
    /// Display names of types to create (split targets, create).
    #[serde(default)]
    pub new_type_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<TypeDefId>,
    /// Split assignments: unit → display name (or id) of its target.
    #[serde(default)]
    pub assignments: BTreeMap<UnitId, String>,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedAlternative {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_operation: Option<ProposedOperation>,
    pub commits_to: String,
    pub forecloses: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeRequest {
    pub contract_version: u8,
    pub project_id: ProjectId,
    pub assessment: AssessmentKind,
    /// Bounded evidence payload; shape depends on `assessment`.
    pub payload: Value,
}

impl JudgeRequest {
    pub fn new(project_id: ProjectId, assessment: AssessmentKind, payload: Value) -> Self {
        Self {
            contract_version: JUDGE_CONTRACT_VERSION,
            project_id,
            assessment,
            payload,
        }
    }

    /// Type id the payload is about, when it names one.
    pub fn subject_type(&self) -> Option<TypeDefId> {
        self.payload
            .get("type_id")
            .and_then(Value::as_str)
            .map(TypeDefId::from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeReply {
    #[serde(default = "default_contract_version")]
    pub contract_version: u8,
    pub assessment_kind: AssessmentKind,
    pub verdict: JudgeVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<Grade>,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_operation: Option<ProposedOperation>,
    #[serde(default)]
    pub alternatives: Vec<ProposedAlternative>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_kind: Option<GapKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_type: Option<SignalType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_type_id: Option<TypeDefId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_disposition: Option<Disposition>,
    #[serde(default)]
    pub transfer_conditions: Vec<String>,
    #[serde(default)]
    pub related_ids: Vec<String>,
}

fn default_contract_version() -> u8 {
    JUDGE_CONTRACT_VERSION
}

impl JudgeReply {
    pub fn new(assessment_kind: AssessmentKind, verdict: JudgeVerdict, rationale: &str) -> Self {
        Self {
            contract_version: JUDGE_CONTRACT_VERSION,
            assessment_kind,
            verdict,
            grade: None,
            rationale: rationale.to_owned(),
            proposed_operation: None,
            alternatives: Vec::new(),
            gap_kind: None,
            signal_type: None,
            affected_type_id: None,
            suggested_disposition: None,
            transfer_conditions: Vec::new(),
            related_ids: Vec::new(),
        }
    }

    pub fn with_grade(mut self, grade: Grade) -> Self {
        self.grade = Some(grade);
        self
    }

    pub fn with_operation(mut self, operation: ProposedOperation) -> Self {
        self.proposed_operation = Some(operation);
        self
    }

    /// Common shape checks: contract version, matching assessment, rationale.
    pub fn validate_for(&self, expected: AssessmentKind) -> TaxonResult<()> {
        if self.contract_version != JUDGE_CONTRACT_VERSION {
            return Err(TaxonError::Validation(format!(
                "unsupported judge contract version {}",
                self.contract_version
            )));
        }
        if self.assessment_kind != expected {
            return Err(TaxonError::Validation(format!(
                "judge answered {:?} for a {:?} request",
                self.assessment_kind, expected
            )));
        }
        if self.rationale.trim().is_empty() {
            return Err(TaxonError::Validation(
                "judge reply carries no rationale".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn severity(&self) -> TaxonResult<Severity> {
        match self.grade {
            Some(Grade::Severity(severity)) => Ok(severity),
            other => Err(TaxonError::Validation(format!(
                "expected a severity grade, got {other:?}"
            ))),
        }
    }

    pub fn confidence(&self) -> TaxonResult<Confidence> {
        match self.grade {
            Some(Grade::Confidence(confidence)) => Ok(confidence),
            other => Err(TaxonError::Validation(format!(
                "expected a confidence grade, got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_serializes_with_scale_tag() {
        let json = serde_json::to_string(&Grade::Severity(Severity::High)).unwrap();
        assert_eq!(json, r#"{"scale":"severity","value":"high"}"#);
    }

    #[test]
    fn reply_for_wrong_assessment_is_rejected() {
        let reply = JudgeReply::new(AssessmentKind::Routing, JudgeVerdict::Affirmed, "fine");
        let err = reply.validate_for(AssessmentKind::Friction).unwrap_err();
        assert!(matches!(err, TaxonError::Validation(_)));
    }

    #[test]
    fn empty_rationale_is_rejected() {
        let reply = JudgeReply::new(AssessmentKind::Friction, JudgeVerdict::Affirmed, "  ");
        assert!(reply.validate_for(AssessmentKind::Friction).is_err());
    }

    #[test]
    fn severity_requires_severity_scale() {
        let reply = JudgeReply::new(AssessmentKind::Friction, JudgeVerdict::Affirmed, "x")
            .with_grade(Grade::Confidence(Confidence::High));
        assert!(reply.severity().is_err());
        assert_eq!(reply.confidence().unwrap(), Confidence::High);
    }

    #[test]
    fn minimal_reply_parses_with_defaults() {
        let json = r#"{
            "assessment_kind": {"kind": "test", "dimension": "usefulness"},
            "verdict": "affirmed",
            "rationale": "covers the stated use"
        }"#;
        let reply: JudgeReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.contract_version, JUDGE_CONTRACT_VERSION);
        assert!(reply.alternatives.is_empty());
        assert!(
            reply
                .validate_for(AssessmentKind::Test {
                    dimension: TestDimension::Usefulness
                })
                .is_ok()
        );
    }
}
