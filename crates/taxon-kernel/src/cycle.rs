//! Detection cycle: evidence → friction → diagnosis → routing.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use taxon_policy::{Routed, RoutingContext};
use taxon_protocol::{
    FrictionEvent, FrictionId, FrictionStatus, GapDiagnosis, LedgerEntry, MigrationId,
    OperationId, ProjectId, RecommendedAction, TaxonError, TypeOperation,
};
use taxon_registry::ProjectState;
use tracing::{debug, info, instrument, warn};

use crate::{ProjectSlot, TaxonKernel};

/// What one detection cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub friction_events: usize,
    pub proposals: usize,
    pub auto_applied: Vec<MigrationId>,
    pub pending: Vec<OperationId>,
    pub suggestions: Vec<OperationId>,
    /// Frictions left for a later cycle or a human.
    pub deferred: Vec<FrictionId>,
    pub oracle_unavailable: Option<String>,
    pub registry_version: u64,
}

impl TaxonKernel {
    /// Run one detection cycle over a project. An unavailable oracle ends
    /// the cycle without proposals; nothing is ever applied by default.
    #[instrument(skip(self), fields(%project_id))]
    pub async fn run_detection_cycle(&self, project_id: &ProjectId) -> Result<CycleReport> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        let mut report = CycleReport::default();

        let snapshot = slot.state.read().await.clone();
        let evidence = self.evidence.gather(&snapshot);
        let detection = self.detector.detect(&evidence, &snapshot.registry).await;
        if let Some(message) = detection.oracle_unavailable {
            warn!(%message, "oracle unavailable, no friction this cycle");
            self.append(
                &slot,
                project_id,
                LedgerEntry::OracleUnavailable {
                    stage: "friction".to_owned(),
                    message: message.clone(),
                },
            )
            .await?;
            report.oracle_unavailable = Some(message);
            return self.finish_cycle(&slot, project_id, report).await;
        }

        for event in detection.events {
            let open = self.decisions.pending_for_project(project_id).await;
            if open.iter().any(|decision| {
                decision
                    .operation
                    .touched_type_ids()
                    .contains(&event.affected_type_id)
            }) {
                debug!(type_id = %event.affected_type_id, "type already awaits a decision");
                continue;
            }
            report.friction_events += 1;
            self.append(
                &slot,
                project_id,
                LedgerEntry::FrictionDetected {
                    event: event.clone(),
                },
            )
            .await?;
            self.set_friction_status(&slot, project_id, &event.id, FrictionStatus::Diagnosing)
                .await?;

            let state = slot.state.read().await.clone();
            let diagnosis = match self.diagnoser.diagnose(&event, &state).await {
                Ok(diagnosis) => diagnosis,
                Err(TaxonError::OracleUnavailable(message)) => {
                    warn!(%message, "oracle unavailable during diagnosis");
                    self.append(
                        &slot,
                        project_id,
                        LedgerEntry::OracleUnavailable {
                            stage: "diagnosis".to_owned(),
                            message: message.clone(),
                        },
                    )
                    .await?;
                    self.defer(&slot, project_id, &event.id, &mut report).await?;
                    report.oracle_unavailable = Some(message);
                    break;
                }
                Err(error) => {
                    warn!(friction_id = %event.id, %error, "diagnosis failed, friction deferred");
                    self.defer(&slot, project_id, &event.id, &mut report).await?;
                    continue;
                }
            };
            self.append(
                &slot,
                project_id,
                LedgerEntry::DiagnosisRecorded {
                    diagnosis: diagnosis.clone(),
                },
            )
            .await?;

            match &diagnosis.recommended_action {
                RecommendedAction::TypeOperation { operation } => {
                    report.proposals += 1;
                    let operation = TypeOperation::clone(operation);
                    self.route_proposal(
                        &slot,
                        &state,
                        operation,
                        &event,
                        &diagnosis,
                        &mut report,
                    )
                    .await?;
                }
                other => {
                    debug!(action = ?other, "no type operation proposed");
                    self.defer(&slot, project_id, &event.id, &mut report).await?;
                }
            }
        }

        self.finish_cycle(&slot, project_id, report).await
    }

    async fn defer(
        &self,
        slot: &ProjectSlot,
        project_id: &ProjectId,
        friction_id: &FrictionId,
        report: &mut CycleReport,
    ) -> Result<()> {
        self.set_friction_status(slot, project_id, friction_id, FrictionStatus::Deferred)
            .await?;
        report.deferred.push(friction_id.clone());
        Ok(())
    }

    async fn route_proposal(
        &self,
        slot: &ProjectSlot,
        state: &ProjectState,
        operation: TypeOperation,
        event: &FrictionEvent,
        diagnosis: &GapDiagnosis,
        report: &mut CycleReport,
    ) -> Result<()> {
        let project_id = &state.project_id;
        let signals = self
            .diagnoser
            .routing_signals(&operation, Some(event), Some(diagnosis), state)
            .await;
        let compensation = match self.executor.plan_compensation(&operation, state) {
            Ok(compensation) => Some(compensation),
            Err(error) => {
                debug!(%error, "no compensation could be planned");
                None
            }
        };
        let context = RoutingContext {
            total_units: state.units.len(),
            friction: Some(event.clone()),
            diagnosis: Some(diagnosis.clone()),
        };

        match self.router.route(operation, signals, context, compensation)? {
            Routed::AutoApply {
                operation,
                compensation,
            } => {
                let operation_id = operation.id.clone();
                match self
                    .apply_locked(slot, project_id, operation, Some(compensation), None)
                    .await
                {
                    Ok(applied) => {
                        report.auto_applied.push(applied.record.id.clone());
                        self.set_friction_status(
                            slot,
                            project_id,
                            &event.id,
                            FrictionStatus::Resolved,
                        )
                        .await?;
                    }
                    Err(error) => {
                        warn!(%operation_id, error = %format!("{error:#}"), "auto-apply failed");
                        self.append(
                            slot,
                            project_id,
                            LedgerEntry::OperationRejected {
                                operation_id,
                                reason: format!("{error:#}"),
                            },
                        )
                        .await?;
                        self.defer(slot, project_id, &event.id, report).await?;
                    }
                }
            }
            Routed::Pending(decision) => {
                let operation_id = decision.operation.id.clone();
                self.decisions.open(decision.as_ref().clone()).await?;
                self.append(
                    slot,
                    project_id,
                    LedgerEntry::DecisionOpened {
                        decision: *decision,
                    },
                )
                .await?;
                info!(%operation_id, "decision opened");
                report.pending.push(operation_id);
            }
            Routed::Suggestion {
                operation,
                rationale,
            } => {
                debug!(operation_id = %operation.id, %rationale, "operation recorded as suggestion");
                report.suggestions.push(operation.id.clone());
                self.append(
                    slot,
                    project_id,
                    LedgerEntry::SuggestionRecorded { operation },
                )
                .await?;
                self.defer(slot, project_id, &event.id, report).await?;
            }
        }
        Ok(())
    }

    async fn finish_cycle(
        &self,
        slot: &ProjectSlot,
        project_id: &ProjectId,
        mut report: CycleReport,
    ) -> Result<CycleReport> {
        report.registry_version = slot.state.read().await.version;
        self.append(
            slot,
            project_id,
            LedgerEntry::CycleCompleted {
                friction_events: report.friction_events,
                proposals: report.proposals,
                auto_applied: report.auto_applied.len(),
                registry_version: report.registry_version,
            },
        )
        .await?;
        info!(
            friction_events = report.friction_events,
            proposals = report.proposals,
            auto_applied = report.auto_applied.len(),
            pending = report.pending.len(),
            "detection cycle complete"
        );
        Ok(report)
    }
}
