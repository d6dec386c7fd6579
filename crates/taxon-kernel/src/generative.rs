//! Coin → Test → Abstract → Promote, plus doctrine publication.

use anyhow::Result;
use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use taxon_protocol::{
    Abstraction, CoinRequest, DemotionEntry, GenesisId, GenesisRecord, GenesisTarget,
    LedgerEntry, PipelineStage, ProjectId, PromotionDecision, PromotionEntry, PromotionSubject,
    SourcePool, TaxonError, TestResult, TypeDefId, Unit, UnitId,
};
use taxon_runtime::type_entry;
use tracing::{debug, info, instrument, warn};

use crate::{ProjectSlot, TaxonKernel};

impl TaxonKernel {
    async fn record_stage(
        &self,
        slot: &ProjectSlot,
        project_id: &ProjectId,
        unit_id: &UnitId,
        from: PipelineStage,
        to: PipelineStage,
    ) -> Result<()> {
        if from != to {
            self.append(
                slot,
                project_id,
                LedgerEntry::StageAdvanced {
                    unit_id: unit_id.clone(),
                    from,
                    to,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn note_oracle_down(
        &self,
        slot: &ProjectSlot,
        project_id: &ProjectId,
        stage: &str,
        error: &TaxonError,
    ) -> Result<()> {
        if let TaxonError::OracleUnavailable(message) = error {
            warn!(stage, %message, "oracle unavailable");
            self.append(
                slot,
                project_id,
                LedgerEntry::OracleUnavailable {
                    stage: stage.to_owned(),
                    message: message.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Instantiate a coin request as a new unit rooted in external evidence.
    #[instrument(skip(self, request), fields(%project_id, type_id = %request.type_id))]
    pub async fn coin_unit(&self, project_id: &ProjectId, request: CoinRequest) -> Result<Unit> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        let mut genesis = GenesisRecord::root(
            project_id.clone(),
            GenesisTarget::Unit,
            String::new(),
            SourcePool::ExternalEvidence,
        )
        .with_note(request.rationale.clone());
        let genesis_id = genesis.id.clone();
        let staged = self
            .stage(&slot, |state| self.pipeline.coin(&request, genesis_id, state))
            .await?;
        let unit = staged.out;
        genesis.target_id = unit.id.to_string();
        self.provenance.record(genesis).await?;
        self.append(
            &slot,
            project_id,
            LedgerEntry::UnitRecorded {
                unit_id: unit.id.clone(),
                type_id: unit.type_id.clone(),
                version: unit.version,
            },
        )
        .await?;
        self.commit_staged(&slot, staged.base, staged.state).await?;
        self.record_stage(
            &slot,
            project_id,
            &unit.id,
            PipelineStage::Draft,
            PipelineStage::Coined,
        )
        .await?;
        Ok(unit)
    }

    /// Edit a unit's fields. Tested or abstracted units go back to Coined.
    #[instrument(skip(self, fields), fields(%project_id, %unit_id))]
    pub async fn revise_unit(
        &self,
        project_id: &ProjectId,
        unit_id: &UnitId,
        fields: IndexMap<String, Value>,
    ) -> Result<Unit> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        let before = slot.state.read().await.units.require(unit_id)?.stage;
        let staged = self
            .stage(&slot, |state| self.pipeline.revise(unit_id, fields, state))
            .await?;
        let unit = staged.out;
        self.append(
            &slot,
            project_id,
            LedgerEntry::UnitRecorded {
                unit_id: unit.id.clone(),
                type_id: unit.type_id.clone(),
                version: unit.version,
            },
        )
        .await?;
        self.commit_staged(&slot, staged.base, staged.state).await?;
        self.record_stage(&slot, project_id, unit_id, before, unit.stage)
            .await?;
        Ok(unit)
    }

    /// Run the test battery. The unit moves to Tested only when every
    /// dimension passed; the result is recorded either way and a failing
    /// unit stays Coined for revision.
    #[instrument(skip(self), fields(%project_id, %unit_id))]
    pub async fn test_unit(&self, project_id: &ProjectId, unit_id: &UnitId) -> Result<TestResult> {
        let slot = self.slot(project_id)?;
        let state = slot.state.read().await.clone();
        let unit = state.units.require(unit_id)?.clone();
        let outcome = self.pipeline.test(&unit, &state).await;

        let _gate = slot.gate.lock().await;
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                self.note_oracle_down(&slot, project_id, "test", &error)
                    .await?;
                return Err(error.into());
            }
        };
        self.append(
            &slot,
            project_id,
            LedgerEntry::TestRecorded {
                result: result.clone(),
            },
        )
        .await?;
        let unresolved = result.unresolved();
        if !unresolved.is_empty() {
            warn!(?unresolved, "test battery left dimensions unresolved");
            return Ok(result);
        }
        if !result.passed() {
            info!("test battery failed, unit stays coined");
            return Ok(result);
        }
        let tested = self
            .mutate(&slot, |state| self.pipeline.record_test(&result, state))
            .await?;
        self.record_stage(&slot, project_id, unit_id, unit.stage, tested.stage)
            .await?;
        Ok(result)
    }

    /// Ask for the unit's summary and transfer conditions and move it to
    /// Abstracted.
    #[instrument(skip(self), fields(%project_id, %unit_id))]
    pub async fn abstract_unit(
        &self,
        project_id: &ProjectId,
        unit_id: &UnitId,
    ) -> Result<Abstraction> {
        let slot = self.slot(project_id)?;
        let state = slot.state.read().await.clone();
        let unit = state.units.require(unit_id)?.clone();
        let outcome = self.pipeline.abstract_unit(&unit, &state).await;

        let _gate = slot.gate.lock().await;
        let abstraction = match outcome {
            Ok(abstraction) => abstraction,
            Err(error) => {
                self.note_oracle_down(&slot, project_id, "abstraction", &error)
                    .await?;
                return Err(error.into());
            }
        };
        let staged = self
            .stage(&slot, |state| {
                self.pipeline.record_abstraction(&abstraction, state)
            })
            .await?;
        let abstracted = staged.out;
        self.append(
            &slot,
            project_id,
            LedgerEntry::AbstractionRecorded {
                abstraction: abstraction.clone(),
            },
        )
        .await?;
        self.commit_staged(&slot, staged.base, staged.state).await?;
        self.record_stage(&slot, project_id, unit_id, unit.stage, abstracted.stage)
            .await?;
        Ok(abstraction)
    }

    /// Evaluate a unit for doctrine. Approval records the promotion and
    /// moves the unit to Promoted; a near-duplicate is flagged for a merge
    /// decision instead.
    #[instrument(skip(self), fields(%project_id, %unit_id))]
    pub async fn promote_unit(
        &self,
        project_id: &ProjectId,
        unit_id: &UnitId,
    ) -> Result<PromotionDecision> {
        let slot = self.slot(project_id)?;
        let unit = slot.state.read().await.units.require(unit_id)?.clone();
        let (test, abstraction) = {
            let index = slot.index.read();
            (
                index.tests.get(unit_id).cloned(),
                index.abstractions.get(unit_id).cloned(),
            )
        };
        let decision = self
            .evaluator
            .evaluate(
                project_id,
                &unit,
                test.as_ref(),
                abstraction.as_ref(),
                &self.promotions,
            )
            .await;

        let _gate = slot.gate.lock().await;
        let decision = match decision {
            Ok(decision) => decision,
            Err(error) => {
                self.note_oracle_down(&slot, project_id, "promotion", &error)
                    .await?;
                return Err(error.into());
            }
        };
        match &decision {
            PromotionDecision::Approved { entry } => {
                if self.promotions.is_promoted(&entry.subject) {
                    return Err(TaxonError::Consistency(format!(
                        "unit {unit_id} at version {} is already promoted",
                        unit.version
                    ))
                    .into());
                }
                let promoted = self
                    .mutate(&slot, |state| {
                        let current = state.units.require(unit_id)?;
                        if current.version != unit.version {
                            return Err(TaxonError::Consistency(format!(
                                "unit {unit_id} was revised during evaluation"
                            )));
                        }
                        self.pipeline
                            .transition(unit_id, PipelineStage::Promoted, state)
                    })
                    .await?;
                self.promotions.record_promotion(entry.clone())?;
                self.append(
                    &slot,
                    project_id,
                    LedgerEntry::Promoted {
                        entry: entry.clone(),
                    },
                )
                .await?;
                self.record_stage(&slot, project_id, unit_id, unit.stage, promoted.stage)
                    .await?;
            }
            PromotionDecision::FlagForMerge {
                duplicate_of,
                rationale,
            } => {
                self.append(
                    &slot,
                    project_id,
                    LedgerEntry::PromotionFlagged {
                        unit_id: unit_id.clone(),
                        duplicate_of: duplicate_of.clone(),
                        rationale: rationale.clone(),
                    },
                )
                .await?;
            }
            PromotionDecision::Rejected { reasons } => {
                debug!(?reasons, "promotion rejected");
            }
        }
        Ok(decision)
    }

    pub async fn deprecate_unit(&self, project_id: &ProjectId, unit_id: &UnitId) -> Result<Unit> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        let before = slot.state.read().await.units.require(unit_id)?.stage;
        let unit = self
            .mutate(&slot, |state| self.pipeline.deprecate(unit_id, state))
            .await?;
        self.record_stage(&slot, project_id, unit_id, before, unit.stage)
            .await?;
        Ok(unit)
    }

    /// Take a promoted unit out of doctrine. The unit ends Deprecated.
    #[instrument(skip(self, reason), fields(%project_id, %unit_id))]
    pub async fn demote_unit(
        &self,
        project_id: &ProjectId,
        unit_id: &UnitId,
        reason: &str,
    ) -> Result<DemotionEntry> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        let unit = slot.state.read().await.units.require(unit_id)?.clone();
        let subject = PromotionSubject::Unit {
            unit_id: unit_id.clone(),
            version: unit.version,
        };
        if unit.stage != PipelineStage::Promoted || !self.promotions.is_promoted(&subject) {
            return Err(TaxonError::NotFound(format!(
                "no active promotion for unit {unit_id}"
            ))
            .into());
        }
        self.mutate(&slot, |state| {
            let mut demoted = state.units.require(unit_id)?.clone();
            demoted.set_stage(PipelineStage::Deprecated);
            state.units.replace(demoted)
        })
        .await?;
        let entry = DemotionEntry {
            subject,
            demoted_at: Utc::now(),
            reason: reason.to_owned(),
        };
        self.promotions.record_demotion(entry.clone())?;
        self.append(
            &slot,
            project_id,
            LedgerEntry::Demoted {
                entry: entry.clone(),
            },
        )
        .await?;
        self.record_stage(
            &slot,
            project_id,
            unit_id,
            PipelineStage::Promoted,
            PipelineStage::Deprecated,
        )
        .await?;
        Ok(entry)
    }

    /// Publish a Domain type of this project to the shared doctrine. New
    /// projects inherit it; existing ones are untouched.
    #[instrument(skip(self, summary), fields(%project_id, %type_id))]
    pub async fn promote_type_to_doctrine(
        &self,
        project_id: &ProjectId,
        type_id: &TypeDefId,
        summary: &str,
    ) -> Result<PromotionEntry> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        let definition = slot.state.read().await.registry.require(type_id)?.clone();
        let entry = type_entry(&definition, summary);
        if self.promotions.is_promoted(&entry.subject) {
            return Err(TaxonError::Consistency(format!(
                "type {type_id} at revision {} is already doctrine",
                definition.revision
            ))
            .into());
        }
        self.doctrine.publish(definition.clone())?;
        self.promotions.record_promotion(entry.clone())?;
        self.append(
            &slot,
            project_id,
            LedgerEntry::DoctrinePublished { definition },
        )
        .await?;
        self.append(
            &slot,
            project_id,
            LedgerEntry::Promoted {
                entry: entry.clone(),
            },
        )
        .await?;
        info!(label = %entry.label, "type promoted to doctrine");
        Ok(entry)
    }

    /// Stop handing a doctrine type to new projects. The retraction is
    /// recorded in `project_id`'s ledger.
    #[instrument(skip(self, reason), fields(%project_id, %type_id))]
    pub async fn retract_from_doctrine(
        &self,
        project_id: &ProjectId,
        type_id: &TypeDefId,
        reason: &str,
    ) -> Result<DemotionEntry> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        let definition = self
            .doctrine
            .get(type_id)
            .ok_or_else(|| TaxonError::NotFound(format!("doctrine type {type_id}")))?;
        let subject = PromotionSubject::Type {
            type_id: type_id.clone(),
            revision: definition.revision,
        };
        if !self.promotions.is_promoted(&subject) {
            return Err(TaxonError::NotFound(format!(
                "no active promotion for type {type_id}"
            ))
            .into());
        }
        self.doctrine.retract(type_id)?;
        let entry = DemotionEntry {
            subject,
            demoted_at: Utc::now(),
            reason: reason.to_owned(),
        };
        self.promotions.record_demotion(entry.clone())?;
        self.append(
            &slot,
            project_id,
            LedgerEntry::Demoted {
                entry: entry.clone(),
            },
        )
        .await?;
        self.append(
            &slot,
            project_id,
            LedgerEntry::DoctrineRetracted {
                type_id: type_id.clone(),
            },
        )
        .await?;
        Ok(entry)
    }

    /// Genesis record of a unit and all of its ancestors.
    pub async fn unit_lineage(
        &self,
        project_id: &ProjectId,
        unit_id: &UnitId,
    ) -> Result<Vec<GenesisRecord>> {
        let genesis_id: GenesisId = {
            let slot = self.slot(project_id)?;
            let state = slot.state.read().await;
            state.units.require(unit_id)?.genesis_id.clone()
        };
        self.lineage(project_id, &genesis_id)
    }
}
