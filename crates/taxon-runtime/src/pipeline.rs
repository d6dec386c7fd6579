//! Generative pipeline: coin, test, abstract, revise.
//!
//! Stage changes run against a working copy of the project state; the
//! caller commits. Oracle calls (the test battery and abstraction) take the
//! unit by value and never touch state.

use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::{Value, json};
use taxon_protocol::{
    Abstraction, AssessmentKind, CoinRequest, DimensionResult, GenesisId, JudgePort, JudgeReply,
    JudgeRequest, JudgeVerdict, PipelineStage, TaxonError, TaxonResult, TestDimension,
    TestResult, TestVerdict, TransferCondition, Unit, UnitId,
};
use taxon_registry::ProjectState;
use tracing::{debug, info, instrument, warn};

/// Peers shown to the oracle next to the unit under test.
const PEER_SAMPLES: usize = 5;

fn unit_payload(unit: &Unit, state: &ProjectState) -> Value {
    let peers: Vec<Value> = state
        .units
        .by_type(&unit.type_id)
        .into_iter()
        .filter(|peer| peer.id != unit.id)
        .take(PEER_SAMPLES)
        .map(|peer| json!({ "unit_id": peer.id, "label": peer.label(), "text": peer.text_content() }))
        .collect();
    json!({
        "type_id": unit.type_id,
        "unit_id": unit.id,
        "unit_version": unit.version,
        "domain": unit.domain,
        "fields": unit.display_fields,
        "peers": peers,
    })
}

fn dimension_result(dimension: TestDimension, reply: TaxonResult<JudgeReply>) -> TaxonResult<DimensionResult> {
    let kind = AssessmentKind::Test { dimension };
    let (verdict, rationale) = match reply.and_then(|reply| reply.validate_for(kind).map(|()| reply)) {
        Ok(reply) => {
            let verdict = match reply.verdict {
                JudgeVerdict::Affirmed => TestVerdict::Pass,
                JudgeVerdict::Rejected => TestVerdict::Fail,
                JudgeVerdict::Undetermined => TestVerdict::Unresolved,
            };
            (verdict, reply.rationale)
        }
        Err(TaxonError::OracleUnavailable(message)) => {
            return Err(TaxonError::OracleUnavailable(message));
        }
        Err(error) => {
            warn!(?dimension, %error, "test assessment unusable");
            (TestVerdict::Unresolved, error.to_string())
        }
    };
    Ok(DimensionResult {
        dimension,
        verdict,
        rationale,
    })
}

/// Move a unit along the stage machine.
pub fn advance(unit: &mut Unit, to: PipelineStage) -> TaxonResult<()> {
    if !unit.stage.can_advance_to(to) {
        return Err(TaxonError::InvalidTransition(format!(
            "unit {} cannot go from {:?} to {:?}",
            unit.id, unit.stage, to
        )));
    }
    unit.set_stage(to);
    Ok(())
}

#[derive(Clone)]
pub struct GenerativePipeline {
    judge: Arc<dyn JudgePort>,
}

impl GenerativePipeline {
    pub fn new(judge: Arc<dyn JudgePort>) -> Self {
        Self { judge }
    }

    /// Instantiate a coin request as a new unit in the Coined stage.
    pub fn coin(
        &self,
        request: &CoinRequest,
        genesis_id: GenesisId,
        state: &mut ProjectState,
    ) -> TaxonResult<Unit> {
        if request.domain.trim().is_empty() {
            return Err(TaxonError::Validation("coin request names no domain".to_owned()));
        }
        let mut unit = Unit::new(
            state.project_id.clone(),
            request.type_id.clone(),
            0,
            request.domain.trim(),
            genesis_id,
        );
        for (name, value) in &request.seed_fields {
            unit.display_fields.insert(name.clone(), value.clone());
        }
        advance(&mut unit, PipelineStage::Coined)?;
        state.units.insert(unit.clone(), &state.registry)?;
        let unit = state.units.require(&unit.id)?.clone();
        info!(unit_id = %unit.id, type_id = %unit.type_id, "unit coined");
        Ok(unit)
    }

    /// Run the fixed battery against the unit's current version.
    #[instrument(skip(self, unit, state), fields(unit_id = %unit.id, version = unit.version))]
    pub async fn test(&self, unit: &Unit, state: &ProjectState) -> TaxonResult<TestResult> {
        if !unit.stage.can_advance_to(PipelineStage::Tested) {
            return Err(TaxonError::InvalidTransition(format!(
                "unit {} is {:?} and cannot be tested",
                unit.id, unit.stage
            )));
        }
        let payload = unit_payload(unit, state);
        let mut results = Vec::with_capacity(TestDimension::BATTERY.len());
        for dimension in TestDimension::BATTERY {
            let request = JudgeRequest::new(
                state.project_id.clone(),
                AssessmentKind::Test { dimension },
                payload.clone(),
            );
            let reply = self.judge.judge(request).await;
            results.push(dimension_result(dimension, reply)?);
        }
        let result = TestResult {
            unit_id: unit.id.clone(),
            unit_version: unit.version,
            results,
            tested_at: Utc::now(),
        };
        debug!(passed = result.passed(), unresolved = result.unresolved().len(), "battery finished");
        Ok(result)
    }

    /// Move the unit to Tested. Only a battery that passed every dimension
    /// advances it; refused too when the unit was revised after the run.
    pub fn record_test(&self, result: &TestResult, state: &mut ProjectState) -> TaxonResult<Unit> {
        let mut unit = state.units.require(&result.unit_id)?.clone();
        if unit.version != result.unit_version {
            return Err(TaxonError::Consistency(format!(
                "test ran against version {} of unit {}, which is now at {}",
                result.unit_version, unit.id, unit.version
            )));
        }
        let unresolved = result.unresolved();
        if !unresolved.is_empty() {
            return Err(TaxonError::Validation(format!(
                "unit {} has unresolved test dimensions: {unresolved:?}",
                unit.id
            )));
        }
        if !result.passed() {
            let failed: Vec<TestDimension> = result
                .results
                .iter()
                .filter(|r| r.verdict == TestVerdict::Fail)
                .map(|r| r.dimension)
                .collect();
            return Err(TaxonError::Validation(format!(
                "unit {} failed test dimensions {failed:?} and needs revision",
                unit.id
            )));
        }
        advance(&mut unit, PipelineStage::Tested)?;
        state.units.replace(unit.clone())?;
        Ok(unit)
    }

    /// Ask the oracle for a summary and cross-project transfer conditions.
    #[instrument(skip(self, unit, state), fields(unit_id = %unit.id))]
    pub async fn abstract_unit(&self, unit: &Unit, state: &ProjectState) -> TaxonResult<Abstraction> {
        if unit.stage != PipelineStage::Tested {
            return Err(TaxonError::InvalidTransition(format!(
                "unit {} is {:?}; only tested units are abstracted",
                unit.id, unit.stage
            )));
        }
        let request = JudgeRequest::new(
            state.project_id.clone(),
            AssessmentKind::Abstraction,
            unit_payload(unit, state),
        );
        let reply = self.judge.judge(request).await?;
        reply.validate_for(AssessmentKind::Abstraction)?;
        if reply.verdict != JudgeVerdict::Affirmed {
            return Err(TaxonError::Validation(format!(
                "no abstraction for unit {}: {}",
                unit.id, reply.rationale
            )));
        }
        let transfer_conditions = reply
            .transfer_conditions
            .iter()
            .map(|condition| condition.trim())
            .filter(|condition| !condition.is_empty())
            .map(|condition| TransferCondition {
                description: condition.to_owned(),
            })
            .collect();
        Ok(Abstraction {
            unit_id: unit.id.clone(),
            unit_version: unit.version,
            summary: reply.rationale,
            transfer_conditions,
        })
    }

    pub fn record_abstraction(
        &self,
        abstraction: &Abstraction,
        state: &mut ProjectState,
    ) -> TaxonResult<Unit> {
        let mut unit = state.units.require(&abstraction.unit_id)?.clone();
        if unit.version != abstraction.unit_version {
            return Err(TaxonError::Consistency(format!(
                "abstraction was written for version {} of unit {}",
                abstraction.unit_version, unit.id
            )));
        }
        advance(&mut unit, PipelineStage::Abstracted)?;
        state.units.replace(unit.clone())?;
        Ok(unit)
    }

    /// Edit display fields. A tested or abstracted unit loops back to Coined.
    pub fn revise(
        &self,
        unit_id: &UnitId,
        fields: IndexMap<String, Value>,
        state: &mut ProjectState,
    ) -> TaxonResult<Unit> {
        let mut unit = state.units.require(unit_id)?.clone();
        if unit.stage.is_terminal() {
            return Err(TaxonError::InvalidTransition(format!(
                "unit {unit_id} is {:?} and can no longer be revised",
                unit.stage
            )));
        }
        for (name, value) in fields {
            unit.display_fields.insert(name, value);
        }
        let definition = state.registry.require(&unit.type_id)?;
        if let Some(missing) = definition.schema.iter().find(|field| {
            field.required
                && unit
                    .display_fields
                    .get(&field.name)
                    .is_none_or(Value::is_null)
        }) {
            return Err(TaxonError::Validation(format!(
                "revision drops required field {} of unit {unit_id}",
                missing.name
            )));
        }
        if matches!(unit.stage, PipelineStage::Tested | PipelineStage::Abstracted) {
            advance(&mut unit, PipelineStage::Coined)?;
        }
        unit.type_revision = definition.revision;
        unit.bump_version();
        state.units.replace(unit.clone())?;
        debug!(unit_id = %unit.id, version = unit.version, stage = ?unit.stage, "unit revised");
        Ok(unit)
    }

    pub fn deprecate(&self, unit_id: &UnitId, state: &mut ProjectState) -> TaxonResult<Unit> {
        self.transition(unit_id, PipelineStage::Deprecated, state)
    }

    pub fn transition(
        &self,
        unit_id: &UnitId,
        to: PipelineStage,
        state: &mut ProjectState,
    ) -> TaxonResult<Unit> {
        let mut unit = state.units.require(unit_id)?.clone();
        advance(&mut unit, to)?;
        state.units.replace(unit.clone())?;
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{domain_type, state_with};
    use taxon_judge::{OfflineJudge, ScriptedJudge};
    use taxon_protocol::CONCEPT;

    fn coin_request() -> CoinRequest {
        CoinRequest {
            type_id: "moat".into(),
            domain: "strategy".into(),
            seed_fields: IndexMap::from([
                ("name".to_owned(), json!("Switching costs")),
                ("definition".to_owned(), json!("cost of leaving a vendor")),
            ]),
            rationale: "missing instance".into(),
        }
    }

    fn battery(judge: &ScriptedJudge, verdicts: [JudgeVerdict; 3]) {
        for (dimension, verdict) in TestDimension::BATTERY.into_iter().zip(verdicts) {
            let kind = AssessmentKind::Test { dimension };
            judge.script(kind, JudgeReply::new(kind, verdict, "reviewed"));
        }
    }

    fn coined() -> (ProjectState, Unit) {
        let mut state = state_with(vec![domain_type("Moat", CONCEPT)]);
        let pipeline = GenerativePipeline::new(Arc::new(OfflineJudge));
        let unit = pipeline
            .coin(&coin_request(), GenesisId::from("g-1"), &mut state)
            .unwrap();
        (state, unit)
    }

    #[test]
    fn coin_creates_coined_unit() {
        let (state, unit) = coined();
        assert_eq!(unit.stage, PipelineStage::Coined);
        assert_eq!(unit.type_revision, 1);
        assert_eq!(state.units.get(&unit.id).unwrap().label(), "Switching costs");
    }

    #[test]
    fn coin_needs_required_fields() {
        let mut state = state_with(vec![domain_type("Moat", CONCEPT)]);
        let mut request = coin_request();
        request.seed_fields.shift_remove("name");
        let err = GenerativePipeline::new(Arc::new(OfflineJudge))
            .coin(&request, GenesisId::default(), &mut state)
            .unwrap_err();
        assert!(matches!(err, TaxonError::Validation(_)));
    }

    #[tokio::test]
    async fn passing_battery_moves_unit_to_tested() {
        let (mut state, unit) = coined();
        let judge = Arc::new(ScriptedJudge::new());
        battery(&judge, [JudgeVerdict::Affirmed; 3]);
        let pipeline = GenerativePipeline::new(judge.clone());
        let result = pipeline.test(&unit, &state).await.unwrap();
        assert!(result.passed());
        assert_eq!(judge.requests().len(), 3);

        let tested = pipeline.record_test(&result, &mut state).unwrap();
        assert_eq!(tested.stage, PipelineStage::Tested);
    }

    #[tokio::test]
    async fn unresolved_dimension_keeps_unit_coined() {
        let (mut state, unit) = coined();
        let judge = Arc::new(ScriptedJudge::new());
        battery(
            &judge,
            [JudgeVerdict::Affirmed, JudgeVerdict::Undetermined, JudgeVerdict::Rejected],
        );
        let pipeline = GenerativePipeline::new(judge);
        let result = pipeline.test(&unit, &state).await.unwrap();
        assert_eq!(result.unresolved(), vec![TestDimension::EdgeCaseCoverage]);
        assert!(pipeline.record_test(&result, &mut state).is_err());
        assert_eq!(
            state.units.get(&unit.id).unwrap().stage,
            PipelineStage::Coined
        );
    }

    #[tokio::test]
    async fn failing_battery_keeps_unit_coined() {
        let (mut state, unit) = coined();
        let judge = Arc::new(ScriptedJudge::new());
        battery(&judge, [JudgeVerdict::Rejected; 3]);
        let pipeline = GenerativePipeline::new(judge);
        let result = pipeline.test(&unit, &state).await.unwrap();
        assert!(result.unresolved().is_empty());
        assert!(!result.passed());

        let err = pipeline.record_test(&result, &mut state).unwrap_err();
        assert!(matches!(err, TaxonError::Validation(_)));
        let still = state.units.get(&unit.id).unwrap().clone();
        assert_eq!(still.stage, PipelineStage::Coined);
        assert!(pipeline.abstract_unit(&still, &state).await.is_err());
    }

    #[tokio::test]
    async fn malformed_reply_is_unresolved_not_fatal() {
        let (state, unit) = coined();
        let judge = Arc::new(ScriptedJudge::new());
        for dimension in [TestDimension::Consistency, TestDimension::EdgeCaseCoverage] {
            let kind = AssessmentKind::Test { dimension };
            judge.script(kind, JudgeReply::new(kind, JudgeVerdict::Affirmed, "reviewed"));
        }
        judge.script(
            AssessmentKind::Test {
                dimension: TestDimension::Usefulness,
            },
            JudgeReply::new(AssessmentKind::Abstraction, JudgeVerdict::Affirmed, "wrong kind"),
        );
        let result = GenerativePipeline::new(judge).test(&unit, &state).await.unwrap();
        assert_eq!(result.unresolved(), vec![TestDimension::Usefulness]);
    }

    #[tokio::test]
    async fn unavailable_oracle_aborts_the_battery() {
        let (state, unit) = coined();
        let err = GenerativePipeline::new(Arc::new(OfflineJudge))
            .test(&unit, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, TaxonError::OracleUnavailable(_)));
    }

    #[tokio::test]
    async fn revision_after_test_loops_back_and_invalidates_result() {
        let (mut state, unit) = coined();
        let judge = Arc::new(ScriptedJudge::new());
        battery(&judge, [JudgeVerdict::Affirmed; 3]);
        let pipeline = GenerativePipeline::new(judge);
        let result = pipeline.test(&unit, &state).await.unwrap();
        pipeline.record_test(&result, &mut state).unwrap();

        let revised = pipeline
            .revise(
                &unit.id,
                IndexMap::from([("definition".to_owned(), json!("sticky contracts"))]),
                &mut state,
            )
            .unwrap();
        assert_eq!(revised.stage, PipelineStage::Coined);
        assert_eq!(revised.version, unit.version + 1);

        let err = pipeline.record_test(&result, &mut state).unwrap_err();
        assert!(matches!(err, TaxonError::Consistency(_)));
    }

    #[tokio::test]
    async fn abstraction_keeps_non_empty_conditions() {
        let (mut state, unit) = coined();
        let judge = Arc::new(ScriptedJudge::new());
        battery(&judge, [JudgeVerdict::Affirmed; 3]);
        let mut reply = JudgeReply::new(
            AssessmentKind::Abstraction,
            JudgeVerdict::Affirmed,
            "lock-in through integration cost",
        );
        reply.transfer_conditions = vec!["B2B software".into(), "  ".into()];
        judge.script(AssessmentKind::Abstraction, reply);
        let pipeline = GenerativePipeline::new(judge);

        let result = pipeline.test(&unit, &state).await.unwrap();
        let tested = pipeline.record_test(&result, &mut state).unwrap();
        let abstraction = pipeline.abstract_unit(&tested, &state).await.unwrap();
        assert_eq!(abstraction.transfer_conditions.len(), 1);
        assert_eq!(abstraction.summary, "lock-in through integration cost");

        let abstracted = pipeline.record_abstraction(&abstraction, &mut state).unwrap();
        assert_eq!(abstracted.stage, PipelineStage::Abstracted);
    }

    #[test]
    fn deprecated_is_terminal() {
        let (mut state, unit) = coined();
        let pipeline = GenerativePipeline::new(Arc::new(OfflineJudge));
        pipeline.deprecate(&unit.id, &mut state).unwrap();
        let err = pipeline
            .transition(&unit.id, PipelineStage::Tested, &mut state)
            .unwrap_err();
        assert!(matches!(err, TaxonError::InvalidTransition(_)));
        assert!(pipeline.deprecate(&unit.id, &mut state).is_err());
    }
}
