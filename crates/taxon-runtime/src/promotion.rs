//! Doctrine admission: the promotion ledger index and the evaluator.

use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::json;
use taxon_protocol::{
    Abstraction, AssessmentKind, DemotionEntry, EvaluationId, JudgePort, JudgeRequest,
    JudgeVerdict, LedgerEntry, PipelineStage, ProjectId, PromotionDecision, PromotionEntry,
    PromotionSubject, TaxonError, TaxonResult, TestResult, TypeDefinition, Unit,
};
use tracing::{debug, info, instrument};

/// Stable text key for a subject, as shown to the duplication oracle.
pub fn subject_key(subject: &PromotionSubject) -> String {
    match subject {
        PromotionSubject::Unit { unit_id, version } => format!("unit:{unit_id}@{version}"),
        PromotionSubject::Type { type_id, revision } => format!("type:{type_id}@{revision}"),
    }
}

fn subject_id(subject: &PromotionSubject) -> &str {
    match subject {
        PromotionSubject::Unit { unit_id, .. } => unit_id.as_str(),
        PromotionSubject::Type { type_id, .. } => type_id.as_str(),
    }
}

/// Promotion entry for a type published to doctrine.
pub fn type_entry(definition: &TypeDefinition, summary: impl Into<String>) -> PromotionEntry {
    PromotionEntry {
        subject: PromotionSubject::Type {
            type_id: definition.id.clone(),
            revision: definition.revision,
        },
        promoted_at: Utc::now(),
        evaluation_ref: EvaluationId::default(),
        label: definition.display_name().to_owned(),
        summary: summary.into(),
        transfer_conditions: Vec::new(),
        schema_version: 1,
    }
}

#[derive(Debug, Default)]
struct Index {
    active: IndexMap<PromotionSubject, PromotionEntry>,
    demotions: Vec<DemotionEntry>,
}

/// Accepted doctrine across all projects. Entries leave only through an
/// explicit demotion.
#[derive(Debug, Default)]
pub struct PromotionLedger {
    index: RwLock<Index>,
}

impl PromotionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&self, entry: &LedgerEntry) {
        match entry {
            LedgerEntry::Promoted { entry } => {
                self.index
                    .write()
                    .active
                    .insert(entry.subject.clone(), entry.clone());
            }
            LedgerEntry::Demoted { entry } => {
                let mut index = self.index.write();
                index.active.shift_remove(&entry.subject);
                index.demotions.push(entry.clone());
            }
            _ => {}
        }
    }

    pub fn is_promoted(&self, subject: &PromotionSubject) -> bool {
        self.index.read().active.contains_key(subject)
    }

    pub fn active(&self) -> Vec<PromotionEntry> {
        self.index.read().active.values().cloned().collect()
    }

    pub fn demotions(&self) -> Vec<DemotionEntry> {
        self.index.read().demotions.clone()
    }

    pub fn record_promotion(&self, entry: PromotionEntry) -> TaxonResult<()> {
        let mut index = self.index.write();
        if index.active.contains_key(&entry.subject) {
            return Err(TaxonError::Consistency(format!(
                "{} is already promoted",
                subject_key(&entry.subject)
            )));
        }
        info!(subject = %subject_key(&entry.subject), "promoted to doctrine");
        index.active.insert(entry.subject.clone(), entry);
        Ok(())
    }

    pub fn record_demotion(&self, entry: DemotionEntry) -> TaxonResult<()> {
        let mut index = self.index.write();
        if index.active.shift_remove(&entry.subject).is_none() {
            return Err(TaxonError::NotFound(format!(
                "no active promotion for {}",
                subject_key(&entry.subject)
            )));
        }
        info!(subject = %subject_key(&entry.subject), reason = %entry.reason, "demoted from doctrine");
        index.demotions.push(entry);
        Ok(())
    }
}

#[derive(Clone)]
pub struct PromotionEvaluator {
    judge: Arc<dyn JudgePort>,
}

impl PromotionEvaluator {
    pub fn new(judge: Arc<dyn JudgePort>) -> Self {
        Self { judge }
    }

    /// Decide whether `unit` at its current version joins doctrine.
    #[instrument(skip_all, fields(%project_id, unit_id = %unit.id, version = unit.version))]
    pub async fn evaluate(
        &self,
        project_id: &ProjectId,
        unit: &Unit,
        test: Option<&TestResult>,
        abstraction: Option<&Abstraction>,
        ledger: &PromotionLedger,
    ) -> TaxonResult<PromotionDecision> {
        let subject = PromotionSubject::Unit {
            unit_id: unit.id.clone(),
            version: unit.version,
        };
        let mut reasons = Vec::new();
        if unit.stage != PipelineStage::Abstracted {
            reasons.push(format!("unit is {:?}, not abstracted", unit.stage));
        }
        match test {
            Some(test) if test.unit_version != unit.version => reasons.push(format!(
                "test ran against version {}, unit is at {}",
                test.unit_version, unit.version
            )),
            Some(test) if !test.passed() => {
                reasons.push("test battery did not pass".to_owned());
            }
            Some(_) => {}
            None => reasons.push("no test result".to_owned()),
        }
        let conditions = match abstraction {
            Some(abstraction) if abstraction.unit_version != unit.version => {
                reasons.push("abstraction is for an older version".to_owned());
                Vec::new()
            }
            Some(abstraction) => abstraction.transfer_conditions.clone(),
            None => Vec::new(),
        };
        if conditions.is_empty() {
            reasons.push("no cross-project transfer condition".to_owned());
        }
        if ledger.is_promoted(&subject) {
            reasons.push("this version is already promoted".to_owned());
        }
        if !reasons.is_empty() {
            debug!(?reasons, "promotion rejected");
            return Ok(PromotionDecision::Rejected { reasons });
        }

        let summary = abstraction
            .map(|abstraction| abstraction.summary.clone())
            .unwrap_or_default();
        let existing = ledger.active();
        if !existing.is_empty() {
            let candidates: Vec<_> = existing
                .iter()
                .map(|entry| {
                    json!({
                        "key": subject_key(&entry.subject),
                        "label": entry.label,
                        "summary": entry.summary,
                    })
                })
                .collect();
            let request = JudgeRequest::new(
                project_id.clone(),
                AssessmentKind::Duplication,
                json!({
                    "type_id": unit.type_id,
                    "unit_id": unit.id,
                    "label": unit.label(),
                    "summary": summary,
                    "candidates": candidates,
                }),
            );
            let reply = self.judge.judge(request).await?;
            reply.validate_for(AssessmentKind::Duplication)?;
            match reply.verdict {
                JudgeVerdict::Affirmed => {
                    let duplicate_of: Vec<PromotionSubject> = existing
                        .iter()
                        .map(|entry| &entry.subject)
                        .filter(|subject| {
                            reply.related_ids.iter().any(|related| {
                                related == &subject_key(subject) || related == subject_id(subject)
                            })
                        })
                        .cloned()
                        .collect();
                    if duplicate_of.is_empty() {
                        return Err(TaxonError::Validation(
                            "duplicate verdict names no promoted entry".to_owned(),
                        ));
                    }
                    info!(duplicates = duplicate_of.len(), "promotion flagged for merge");
                    return Ok(PromotionDecision::FlagForMerge {
                        duplicate_of,
                        rationale: reply.rationale,
                    });
                }
                JudgeVerdict::Rejected => {}
                JudgeVerdict::Undetermined => {
                    return Err(TaxonError::Validation(format!(
                        "duplication undetermined: {}",
                        reply.rationale
                    )));
                }
            }
        }

        Ok(PromotionDecision::Approved {
            entry: PromotionEntry {
                subject,
                promoted_at: Utc::now(),
                evaluation_ref: EvaluationId::default(),
                label: unit.label(),
                summary,
                transfer_conditions: conditions,
                schema_version: 1,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxon_judge::{OfflineJudge, ScriptedJudge};
    use taxon_protocol::{
        DimensionResult, GenesisId, JudgeReply, TestDimension, TestVerdict, TransferCondition,
        UnitId,
    };

    fn abstracted_unit() -> Unit {
        let mut unit = Unit::new(
            ProjectId::from("research"),
            "moat".into(),
            1,
            "strategy",
            GenesisId::default(),
        )
        .with_field("name", "Switching costs");
        unit.set_stage(PipelineStage::Abstracted);
        unit
    }

    fn passing(unit: &Unit) -> TestResult {
        TestResult {
            unit_id: unit.id.clone(),
            unit_version: unit.version,
            results: TestDimension::BATTERY
                .into_iter()
                .map(|dimension| DimensionResult {
                    dimension,
                    verdict: TestVerdict::Pass,
                    rationale: "ok".into(),
                })
                .collect(),
            tested_at: Utc::now(),
        }
    }

    fn abstraction(unit: &Unit, conditions: &[&str]) -> Abstraction {
        Abstraction {
            unit_id: unit.id.clone(),
            unit_version: unit.version,
            summary: "lock-in".into(),
            transfer_conditions: conditions
                .iter()
                .map(|c| TransferCondition {
                    description: (*c).to_owned(),
                })
                .collect(),
        }
    }

    fn seeded_ledger() -> (PromotionLedger, PromotionSubject) {
        let ledger = PromotionLedger::new();
        let subject = PromotionSubject::Unit {
            unit_id: UnitId::from("earlier"),
            version: 3,
        };
        ledger
            .record_promotion(PromotionEntry {
                subject: subject.clone(),
                promoted_at: Utc::now(),
                evaluation_ref: EvaluationId::default(),
                label: "Vendor lock-in".into(),
                summary: "cost of leaving".into(),
                transfer_conditions: Vec::new(),
                schema_version: 1,
            })
            .unwrap();
        (ledger, subject)
    }

    #[tokio::test]
    async fn complete_unit_is_approved_on_empty_ledger() {
        let unit = abstracted_unit();
        let decision = PromotionEvaluator::new(Arc::new(OfflineJudge))
            .evaluate(
                &unit.project_id,
                &unit,
                Some(&passing(&unit)),
                Some(&abstraction(&unit, &["B2B software"])),
                &PromotionLedger::new(),
            )
            .await
            .unwrap();
        let PromotionDecision::Approved { entry } = decision else {
            panic!("expected approval, got {decision:?}");
        };
        assert_eq!(entry.label, "Switching costs");
        assert_eq!(entry.transfer_conditions.len(), 1);
    }

    #[tokio::test]
    async fn stale_test_and_missing_conditions_are_reported() {
        let mut unit = abstracted_unit();
        let test = passing(&unit);
        let abstraction = abstraction(&unit, &[]);
        unit.bump_version();
        let decision = PromotionEvaluator::new(Arc::new(OfflineJudge))
            .evaluate(
                &unit.project_id,
                &unit,
                Some(&test),
                Some(&abstraction),
                &PromotionLedger::new(),
            )
            .await
            .unwrap();
        let PromotionDecision::Rejected { reasons } = decision else {
            panic!("expected rejection");
        };
        assert_eq!(reasons.len(), 3);
    }

    #[tokio::test]
    async fn near_duplicate_is_flagged_not_rejected() {
        let unit = abstracted_unit();
        let (ledger, earlier) = seeded_ledger();
        let judge = Arc::new(ScriptedJudge::new());
        let mut reply = JudgeReply::new(
            AssessmentKind::Duplication,
            JudgeVerdict::Affirmed,
            "same mechanism",
        );
        reply.related_ids = vec![subject_key(&earlier)];
        judge.script(AssessmentKind::Duplication, reply);

        let decision = PromotionEvaluator::new(judge)
            .evaluate(
                &unit.project_id,
                &unit,
                Some(&passing(&unit)),
                Some(&abstraction(&unit, &["B2B software"])),
                &ledger,
            )
            .await
            .unwrap();
        assert_eq!(
            decision,
            PromotionDecision::FlagForMerge {
                duplicate_of: vec![earlier],
                rationale: "same mechanism".into(),
            }
        );
    }

    #[tokio::test]
    async fn distinct_unit_is_approved_against_ledger() {
        let unit = abstracted_unit();
        let (ledger, _) = seeded_ledger();
        let judge = Arc::new(ScriptedJudge::new());
        judge.script(
            AssessmentKind::Duplication,
            JudgeReply::new(AssessmentKind::Duplication, JudgeVerdict::Rejected, "different"),
        );
        let decision = PromotionEvaluator::new(judge)
            .evaluate(
                &unit.project_id,
                &unit,
                Some(&passing(&unit)),
                Some(&abstraction(&unit, &["B2B software"])),
                &ledger,
            )
            .await
            .unwrap();
        assert!(matches!(decision, PromotionDecision::Approved { .. }));
    }

    #[tokio::test]
    async fn undetermined_duplication_is_never_silently_accepted() {
        let unit = abstracted_unit();
        let (ledger, _) = seeded_ledger();
        let err = PromotionEvaluator::new(Arc::new(ScriptedJudge::new()))
            .evaluate(
                &unit.project_id,
                &unit,
                Some(&passing(&unit)),
                Some(&abstraction(&unit, &["B2B software"])),
                &ledger,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaxonError::Validation(_)));
    }

    #[test]
    fn promotion_is_monotonic_until_demoted() {
        let (ledger, subject) = seeded_ledger();
        let again = ledger.active()[0].clone();
        assert!(ledger.record_promotion(again.clone()).is_err());

        ledger
            .record_demotion(DemotionEntry {
                subject: subject.clone(),
                demoted_at: Utc::now(),
                reason: "superseded".into(),
            })
            .unwrap();
        assert!(!ledger.is_promoted(&subject));
        assert_eq!(ledger.demotions().len(), 1);
        ledger.record_promotion(again).unwrap();
        assert!(ledger.is_promoted(&subject));
    }

    #[test]
    fn replay_follows_ledger_order() {
        let (source, subject) = seeded_ledger();
        let entry = source.active()[0].clone();
        let replayed = PromotionLedger::new();
        replayed.ingest(&LedgerEntry::Promoted { entry });
        replayed.ingest(&LedgerEntry::Demoted {
            entry: DemotionEntry {
                subject: subject.clone(),
                demoted_at: Utc::now(),
                reason: "retired".into(),
            },
        });
        assert!(replayed.active().is_empty());
        assert_eq!(replayed.demotions()[0].subject, subject);
    }
}
