//! Pending decisions, migrations and their undo.
//!
//! When two open decisions overlap, the first one applied wins: the others
//! are closed as superseded and their friction goes back to `Detected` for
//! a fresh diagnosis against the new taxonomy.

use anyhow::{Context, Result};
use chrono::Utc;
use taxon_protocol::{
    AlternativeId, CompensatingOperation, DecisionResolution, FrictionId, FrictionStatus,
    GenesisId, GenesisRecord, GenesisTarget, LedgerEntry, MigrationId, MigrationPlan,
    MigrationRecord, OperationId, OperationStatus, PendingDecision, ProjectId, ResolutionOutcome,
    SourcePool, TaxonError, TypeDefinition, TypeOperation,
};
use taxon_registry::ProjectState;
use taxon_runtime::AppliedMigration;
use tracing::{info, instrument, warn};

use crate::{ProjectSlot, TaxonKernel};

const SYSTEM_ACTOR: &str = "taxon";

fn friction_of(decision: &PendingDecision) -> Option<FrictionId> {
    decision
        .operation
        .friction_id
        .clone()
        .or_else(|| decision.friction.as_ref().map(|event| event.id.clone()))
}

/// Errors after which the chosen operation can never succeed as proposed.
fn is_terminal(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<TaxonError>(),
        Some(
            TaxonError::MigrationConflict { .. }
                | TaxonError::Consistency(_)
                | TaxonError::NotFound(_)
                | TaxonError::Validation(_)
        )
    )
}

impl TaxonKernel {
    /// Open decisions of a project, oldest first, with their alternatives.
    pub async fn list_pending(&self, project_id: &ProjectId) -> Result<Vec<PendingDecision>> {
        self.slot(project_id)?;
        Ok(self.decisions.pending_for_project(project_id).await)
    }

    pub async fn decision(&self, operation_id: &OperationId) -> Option<PendingDecision> {
        self.decisions.get(operation_id).await
    }

    async fn open_decision(
        &self,
        project_id: &ProjectId,
        operation_id: &OperationId,
    ) -> Result<PendingDecision> {
        self.decisions
            .get(operation_id)
            .await
            .filter(|decision| decision.is_open() && decision.operation.project_id == *project_id)
            .ok_or_else(|| TaxonError::NotFound(format!("open decision {operation_id}")).into())
    }

    async fn close_decision(
        &self,
        slot: &ProjectSlot,
        decision: &PendingDecision,
        resolution: DecisionResolution,
        friction_status: FrictionStatus,
    ) -> Result<()> {
        let project_id = &decision.operation.project_id;
        let operation_id = decision.operation.id.clone();
        self.decisions
            .resolve(&operation_id, resolution.clone())
            .await?;
        info!(%operation_id, outcome = ?resolution.outcome, actor = %resolution.actor, "decision resolved");
        self.append(
            slot,
            project_id,
            LedgerEntry::DecisionResolved {
                operation_id,
                resolution,
            },
        )
        .await?;
        if let Some(friction_id) = friction_of(decision) {
            self.set_friction_status(slot, project_id, &friction_id, friction_status)
                .await?;
        }
        Ok(())
    }

    /// Apply a confirmed operation and supersede every overlapping open
    /// decision except `exclude`. The record and its geneses reach the
    /// ledger before the state swap. The caller holds the gate.
    pub(crate) async fn apply_locked(
        &self,
        slot: &ProjectSlot,
        project_id: &ProjectId,
        operation: TypeOperation,
        compensation: Option<CompensatingOperation>,
        exclude: Option<&OperationId>,
    ) -> Result<AppliedMigration> {
        let current = slot.state.read().await.clone();
        let (operation, geneses) = if self.executor.record_for(&operation.id).is_some() {
            (operation, Vec::new())
        } else {
            self.stamp_provenance(&current, operation)
        };
        let applied = self
            .executor
            .prepare(operation, compensation, &current)
            .await?;
        if applied.replayed {
            return Ok(applied);
        }
        for genesis in geneses {
            self.provenance
                .record(genesis)
                .await
                .context("failed recording operation genesis")?;
        }
        self.append(
            slot,
            project_id,
            LedgerEntry::MigrationApplied {
                record: applied.record.clone(),
                operation: applied.operation.clone(),
            },
        )
        .await?;
        self.commit_logged(slot, project_id, &applied.record, &applied.state)
            .await?;
        info!(migration_id = %applied.record.id, version = applied.record.version_after, "migration applied");

        for superseded in self.decisions.overlapping(&applied.operation).await {
            if exclude == Some(&superseded) {
                continue;
            }
            let Some(decision) = self.decisions.get(&superseded).await else {
                continue;
            };
            let resolution = DecisionResolution {
                alternative_id: None,
                actor: SYSTEM_ACTOR.to_owned(),
                outcome: ResolutionOutcome::Superseded {
                    by: applied.operation.id.clone(),
                },
                resolved_at: Utc::now(),
            };
            warn!(operation_id = %superseded, by = %applied.operation.id, "overlapping decision superseded");
            self.close_decision(slot, &decision, resolution, FrictionStatus::Detected)
                .await?;
        }
        Ok(applied)
    }

    /// Swap in the state of a logged migration. When the swap fails the
    /// record is marked aborted so it never counts as applied.
    async fn commit_logged(
        &self,
        slot: &ProjectSlot,
        project_id: &ProjectId,
        record: &MigrationRecord,
        state: &ProjectState,
    ) -> Result<()> {
        if let Err(error) = self.executor.commit(record, state).await {
            warn!(migration_id = %record.id, %error, "state swap failed, aborting migration");
            let aborted = self
                .append(
                    slot,
                    project_id,
                    LedgerEntry::MigrationAborted {
                        migration_id: record.id.clone(),
                        reason: error.to_string(),
                    },
                )
                .await?;
            self.executor.ingest(&aborted.kind);
            return Err(error.into());
        }
        *slot.state.write().await = state.clone();
        Ok(())
    }

    /// Give an operation and every type it creates a genesis record. Fields
    /// a created type introduces get one each, derived from the type's. The
    /// operation derives from the genesis it already carries (a reissue) or
    /// from its affected units; with neither it is a seed.
    fn stamp_provenance(
        &self,
        state: &ProjectState,
        mut operation: TypeOperation,
    ) -> (TypeOperation, Vec<GenesisRecord>) {
        let project_id = operation.project_id.clone();
        let parents: Vec<GenesisId> = match operation.genesis_id.take() {
            Some(original) => vec![original],
            None => {
                let mut ids: Vec<GenesisId> = operation
                    .affected_unit_ids
                    .iter()
                    .filter_map(|unit_id| state.units.get(unit_id))
                    .map(|unit| unit.genesis_id.clone())
                    .filter(|id| self.provenance.get(&project_id, id).is_some())
                    .collect();
                ids.sort();
                ids.dedup();
                ids
            }
        };
        let root = if parents.is_empty() {
            GenesisRecord::root(
                project_id.clone(),
                GenesisTarget::Operation,
                operation.id.as_str(),
                SourcePool::Seed,
            )
        } else {
            GenesisRecord::derived(
                project_id.clone(),
                GenesisTarget::Operation,
                operation.id.as_str(),
                parents,
            )
        }
        .with_note(operation.rationale.clone());
        operation.genesis_id = Some(root.id.clone());

        let mut types = Vec::new();
        let mut fields = Vec::new();
        for definition in operation.migration_plan.created_types_mut() {
            let type_genesis = GenesisRecord::derived(
                project_id.clone(),
                GenesisTarget::Type,
                definition.id.as_str(),
                vec![root.id.clone()],
            );
            definition.genesis_id = Some(type_genesis.id.clone());
            for field in &mut definition.schema {
                if field.origin.type_id != definition.id {
                    continue;
                }
                let field_genesis = GenesisRecord::derived(
                    project_id.clone(),
                    GenesisTarget::Field,
                    definition.id.as_str(),
                    vec![type_genesis.id.clone()],
                )
                .for_field(field.name.clone());
                field.origin.genesis_id = Some(field_genesis.id.clone());
                fields.push(field_genesis);
            }
            types.push(type_genesis);
        }
        let geneses = std::iter::once(root).chain(types).chain(fields).collect();
        (operation, geneses)
    }

    /// Apply a human-authored operation directly, bypassing routing.
    #[instrument(
        skip(self, operation),
        fields(%project_id, operation_id = %operation.id, kind = operation.kind.as_str())
    )]
    pub async fn apply_operation(
        &self,
        project_id: &ProjectId,
        mut operation: TypeOperation,
    ) -> Result<MigrationRecord> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        operation.status = OperationStatus::Confirmed;
        let applied = self
            .apply_locked(&slot, project_id, operation, None, None)
            .await?;
        Ok(applied.record)
    }

    /// Create a Domain or Emergent type by hand.
    pub async fn define_type(
        &self,
        project_id: &ProjectId,
        definition: TypeDefinition,
    ) -> Result<MigrationRecord> {
        let version = self.slot(project_id)?.state.read().await.version;
        let type_id = definition.id.clone();
        let operation = TypeOperation::new(
            project_id.clone(),
            MigrationPlan::Create { definition },
            Vec::new(),
            vec![type_id],
            "defined by hand",
            version,
        );
        self.apply_operation(project_id, operation).await
    }

    /// Choose an alternative of an open decision.
    ///
    /// The status quo closes the decision and defers its friction. Any other
    /// alternative is applied; if it can never apply (stale base, invariant
    /// violation) the decision is withdrawn and the friction reopened, and
    /// the error is returned. Storage failures leave the decision open.
    #[instrument(skip(self, actor), fields(%project_id, %operation_id, %alternative_id))]
    pub async fn resolve(
        &self,
        project_id: &ProjectId,
        operation_id: &OperationId,
        alternative_id: &AlternativeId,
        actor: &str,
    ) -> Result<DecisionResolution> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        let decision = self.open_decision(project_id, operation_id).await?;
        let alternative = decision.alternative(alternative_id).ok_or_else(|| {
            TaxonError::Validation(format!(
                "decision {operation_id} has no alternative {alternative_id}"
            ))
        })?;

        let Some(mut operation) = alternative.operation.clone() else {
            let resolution = DecisionResolution {
                alternative_id: Some(alternative_id.clone()),
                actor: actor.to_owned(),
                outcome: ResolutionOutcome::KeptStatusQuo,
                resolved_at: Utc::now(),
            };
            self.close_decision(&slot, &decision, resolution.clone(), FrictionStatus::Deferred)
                .await?;
            return Ok(resolution);
        };

        operation.status = OperationStatus::Confirmed;
        match self
            .apply_locked(&slot, project_id, operation, None, Some(operation_id))
            .await
        {
            Ok(applied) => {
                let resolution = DecisionResolution {
                    alternative_id: Some(alternative_id.clone()),
                    actor: actor.to_owned(),
                    outcome: ResolutionOutcome::Applied {
                        migration_id: applied.record.id.clone(),
                    },
                    resolved_at: Utc::now(),
                };
                self.close_decision(&slot, &decision, resolution.clone(), FrictionStatus::Resolved)
                    .await?;
                Ok(resolution)
            }
            Err(error) if is_terminal(&error) => {
                let reason = format!("{error:#}");
                warn!(%reason, "chosen alternative cannot be applied, decision withdrawn");
                self.append(
                    &slot,
                    project_id,
                    LedgerEntry::OperationRejected {
                        operation_id: operation_id.clone(),
                        reason,
                    },
                )
                .await?;
                let resolution = DecisionResolution {
                    alternative_id: Some(alternative_id.clone()),
                    actor: actor.to_owned(),
                    outcome: ResolutionOutcome::Withdrawn,
                    resolved_at: Utc::now(),
                };
                self.close_decision(&slot, &decision, resolution, FrictionStatus::Detected)
                    .await?;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Withdraw an open decision before anything is applied.
    #[instrument(skip(self, actor), fields(%project_id, %operation_id))]
    pub async fn withdraw(
        &self,
        project_id: &ProjectId,
        operation_id: &OperationId,
        actor: &str,
    ) -> Result<DecisionResolution> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        let decision = self.open_decision(project_id, operation_id).await?;
        let resolution = DecisionResolution {
            alternative_id: None,
            actor: actor.to_owned(),
            outcome: ResolutionOutcome::Withdrawn,
            resolved_at: Utc::now(),
        };
        self.close_decision(&slot, &decision, resolution.clone(), FrictionStatus::Deferred)
            .await?;
        Ok(resolution)
    }

    pub fn migration(
        &self,
        project_id: &ProjectId,
        migration_id: &MigrationId,
    ) -> Result<MigrationRecord> {
        self.executor
            .find(migration_id)
            .filter(|record| record.project_id == *project_id)
            .ok_or_else(|| TaxonError::NotFound(format!("migration {migration_id}")).into())
    }

    /// Undo an applied migration through its compensating operation.
    #[instrument(skip(self), fields(%project_id, %migration_id))]
    pub async fn revert(
        &self,
        project_id: &ProjectId,
        migration_id: &MigrationId,
    ) -> Result<MigrationRecord> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        let record = self.migration(project_id, migration_id)?;
        let current = slot.state.read().await.clone();
        let (reverted, state) = self.executor.prepare_revert(&record, &current).await?;
        self.append(
            &slot,
            project_id,
            LedgerEntry::MigrationReverted {
                record: reverted.clone(),
            },
        )
        .await?;
        self.commit_logged(&slot, project_id, &reverted, &state)
            .await?;
        info!(reverted = %migration_id, version = reverted.version_after, "migration reverted");
        Ok(reverted)
    }

    /// Apply a reverted migration's operation again, as a fresh reissue
    /// based on the current version.
    #[instrument(skip(self), fields(%project_id, %migration_id))]
    pub async fn reapply(
        &self,
        project_id: &ProjectId,
        migration_id: &MigrationId,
    ) -> Result<MigrationRecord> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        if !self.executor.is_reverted(migration_id) {
            return Err(TaxonError::Consistency(format!(
                "migration {migration_id} is not reverted"
            ))
            .into());
        }
        let operation = {
            let index = slot.index.read();
            let operation = index.operations.get(migration_id).cloned().ok_or_else(|| {
                TaxonError::NotFound(format!("operation applied by migration {migration_id}"))
            })?;
            let live_reissue = index.operations.iter().any(|(id, applied)| {
                applied.reissued_from.as_ref() == Some(&operation.id)
                    && !self.executor.is_reverted(id)
            });
            if live_reissue {
                return Err(TaxonError::Consistency(format!(
                    "migration {migration_id} was already reapplied"
                ))
                .into());
            }
            operation
        };
        let version = slot.state.read().await.version;
        let applied = self
            .apply_locked(&slot, project_id, operation.reissue(version), None, None)
            .await?;
        Ok(applied.record)
    }
}
