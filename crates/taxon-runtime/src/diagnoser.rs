//! Gap diagnosis: friction event → gap kind + recommended action.
//!
//! The oracle proposes; this module materializes the proposal into a
//! concrete [`TypeOperation`] against the current registry. Tier rules are
//! applied here in code: a proposal to merge, split, hide, promote or demote
//! a Universal type degrades to "no action" whatever the oracle said.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::json;
use taxon_policy::{RoutingSignals, describe};
use taxon_protocol::{
    Alternative, AlternativeId, AssessmentKind, CoinRequest, FrictionEvent, GapDiagnosis, GapKind,
    JudgePort, JudgeReply, JudgeRequest, JudgeVerdict, MigrationPlan, OperationKind,
    ProposedOperation, RecommendedAction, SplitAssignment, TaxonError, TaxonResult, Tier,
    TypeDefId, TypeDefinition, TypeOperation, UnitId, is_universal_id,
};
use taxon_registry::ProjectState;
use tracing::{debug, instrument, warn};

/// Units listed in a diagnosis payload.
const MAX_UNITS_IN_PAYLOAD: usize = 32;

/// Outcome of turning an oracle proposal into an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    Operation(TypeOperation),
    /// Forbidden by tier rules; carries the reason.
    Refused(String),
}

#[derive(Clone)]
pub struct Diagnoser {
    judge: Arc<dyn JudgePort>,
}

impl Diagnoser {
    pub fn new(judge: Arc<dyn JudgePort>) -> Self {
        Self { judge }
    }

    #[instrument(
        skip(self, event, state),
        fields(project_id = %event.project_id, friction_id = %event.id, type_id = %event.affected_type_id)
    )]
    pub async fn diagnose(
        &self,
        event: &FrictionEvent,
        state: &ProjectState,
    ) -> TaxonResult<GapDiagnosis> {
        let definition = state.registry.require(&event.affected_type_id)?;
        let units: Vec<_> = state
            .units
            .by_type(&event.affected_type_id)
            .into_iter()
            .take(MAX_UNITS_IN_PAYLOAD)
            .map(|unit| {
                json!({
                    "unit_id": unit.id,
                    "label": unit.label(),
                    "content": unit.text_content(),
                })
            })
            .collect();
        let types: Vec<_> = state
            .registry
            .live_definitions()
            .into_iter()
            .map(|ty| {
                json!({
                    "type_id": ty.id,
                    "display_name": ty.display_name(),
                    "tier": ty.tier,
                    "extends": ty.extends,
                })
            })
            .collect();
        let payload = json!({
            "type_id": event.affected_type_id,
            "friction": event,
            "definition": definition,
            "units": units,
            "types": types,
        });

        let reply = self
            .judge
            .judge(JudgeRequest::new(
                event.project_id.clone(),
                AssessmentKind::Diagnosis,
                payload,
            ))
            .await?;
        reply.validate_for(AssessmentKind::Diagnosis)?;
        let gap_kind = reply.gap_kind.ok_or_else(|| {
            TaxonError::Validation("diagnosis reply names no gap kind".to_owned())
        })?;

        let recommended_action = match &reply.proposed_operation {
            Some(proposal) => match materialize(proposal, event, state, &reply.rationale)? {
                Materialized::Operation(operation) => RecommendedAction::TypeOperation {
                    operation: Box::new(operation),
                },
                Materialized::Refused(reason) => {
                    warn!(%reason, "oracle proposal refused by tier rules");
                    RecommendedAction::NoAction { reason }
                }
            },
            None => content_action(gap_kind, &reply, event, state),
        };
        debug!(gap_kind = ?gap_kind, "friction diagnosed");

        Ok(GapDiagnosis {
            friction_id: event.id.clone(),
            project_id: event.project_id.clone(),
            gap_kind,
            rationale: reply.rationale,
            recommended_action,
            diagnosed_at: Utc::now(),
            schema_version: 1,
        })
    }

    /// Ask the oracle how to route `operation`. Any failure yields empty
    /// signals, which the router sends to a pending decision.
    #[instrument(
        skip(self, operation, event, diagnosis, state),
        fields(project_id = %operation.project_id, operation_id = %operation.id)
    )]
    pub async fn routing_signals(
        &self,
        operation: &TypeOperation,
        event: Option<&FrictionEvent>,
        diagnosis: Option<&GapDiagnosis>,
        state: &ProjectState,
    ) -> RoutingSignals {
        let (commits_to, forecloses) = describe(operation);
        let payload = json!({
            "type_id": operation.touched_type_ids().first(),
            "operation": operation,
            "commits_to": commits_to,
            "forecloses": forecloses,
            "friction": event,
            "gap_kind": diagnosis.map(|d| d.gap_kind),
            "total_units": state.units.len(),
            "affected_units": operation.affected_unit_ids.len(),
        });
        let request = JudgeRequest::new(
            operation.project_id.clone(),
            AssessmentKind::Routing,
            payload,
        );
        let reply = match self.judge.judge(request).await {
            Ok(reply) => reply,
            Err(error) => {
                warn!(%error, "routing assessment failed, falling back to a pending decision");
                return RoutingSignals {
                    rationale: error.to_string(),
                    ..RoutingSignals::default()
                };
            }
        };
        if let Err(error) = reply.validate_for(AssessmentKind::Routing) {
            warn!(%error, "malformed routing assessment");
            return RoutingSignals {
                rationale: error.to_string(),
                ..RoutingSignals::default()
            };
        }

        let mut alternatives = Vec::new();
        for (index, proposed) in reply.alternatives.iter().enumerate() {
            let operation = match &proposed.proposed_operation {
                Some(proposal) => match event {
                    Some(event) => match materialize(proposal, event, state, &reply.rationale) {
                        Ok(Materialized::Operation(operation)) => Some(operation),
                        Ok(Materialized::Refused(reason)) => {
                            debug!(%reason, "dropping refused alternative");
                            continue;
                        }
                        Err(error) => {
                            debug!(%error, "dropping unusable alternative");
                            continue;
                        }
                    },
                    None => continue,
                },
                None => None,
            };
            alternatives.push(Alternative {
                id: AlternativeId::from_string(format!("alt_{}", index + 1)),
                label: proposed.label.clone(),
                operation,
                commits_to: proposed.commits_to.clone(),
                forecloses: proposed.forecloses.clone(),
            });
        }

        RoutingSignals {
            suggested: reply.suggested_disposition,
            confidence: reply.confidence().ok(),
            rationale: reply.rationale,
            alternatives,
        }
    }
}

fn content_action(
    gap_kind: GapKind,
    reply: &JudgeReply,
    event: &FrictionEvent,
    state: &ProjectState,
) -> RecommendedAction {
    if reply.verdict != JudgeVerdict::Affirmed {
        return RecommendedAction::NoAction {
            reason: reply.rationale.clone(),
        };
    }
    match gap_kind {
        GapKind::MissingConcept
        | GapKind::MissingTension
        | GapKind::MissingAgentModel
        | GapKind::MissingInstrument => {
            let domain = state
                .units
                .by_type(&event.affected_type_id)
                .first()
                .map(|unit| unit.domain.clone())
                .unwrap_or_else(|| "general".to_owned());
            RecommendedAction::Coin {
                request: CoinRequest {
                    type_id: event.affected_type_id.clone(),
                    domain,
                    seed_fields: IndexMap::new(),
                    rationale: reply.rationale.clone(),
                },
            }
        }
        GapKind::MissingType => RecommendedAction::NoAction {
            reason: format!(
                "missing type diagnosed without a proposal: {}",
                reply.rationale
            ),
        },
        _ => {
            let unit = reply
                .related_ids
                .iter()
                .map(|id| UnitId::from_string(id.as_str()))
                .find(|id| state.units.get(id).is_some());
            match unit {
                Some(unit_id) => RecommendedAction::ReviseUnit {
                    unit_id,
                    note: reply.rationale.clone(),
                },
                None => RecommendedAction::NoAction {
                    reason: reply.rationale.clone(),
                },
            }
        }
    }
}

fn unique_type_id(state: &ProjectState, name: &str, taken: &BTreeSet<TypeDefId>) -> TypeDefId {
    let base = TypeDefId::slug(name);
    let base = if base.as_str().is_empty() {
        TypeDefId::from("type")
    } else {
        base
    };
    let mut candidate = base.clone();
    let mut suffix = 2;
    while state.registry.contains(&candidate) || taken.contains(&candidate) {
        candidate = TypeDefId::from_string(format!("{base}_{suffix}"));
        suffix += 1;
    }
    candidate
}

fn require_live<'a>(state: &'a ProjectState, id: &TypeDefId) -> TaxonResult<&'a TypeDefinition> {
    let definition = state
        .registry
        .get(id)
        .ok_or_else(|| TaxonError::Validation(format!("proposal names unknown type {id}")))?;
    if !definition.status.is_live() {
        return Err(TaxonError::Validation(format!(
            "proposal names type {id}, which is {:?}",
            definition.status
        )));
    }
    Ok(definition)
}

fn new_type_names(proposal: &ProposedOperation) -> Vec<&str> {
    proposal
        .new_type_names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .collect()
}

fn matches_target(target: &TypeDefinition, name: &str) -> bool {
    let name = name.trim();
    target.display_name().eq_ignore_ascii_case(name)
        || target.id.as_str() == name
        || target.id == TypeDefId::slug(name)
}

/// Materialize an oracle proposal against `state`. Malformed proposals are
/// `Validation` errors; tier violations are `Refused`.
pub fn materialize(
    proposal: &ProposedOperation,
    event: &FrictionEvent,
    state: &ProjectState,
    fallback_rationale: &str,
) -> TaxonResult<Materialized> {
    let subject = proposal
        .source_type_ids
        .first()
        .cloned()
        .unwrap_or_else(|| event.affected_type_id.clone());

    if proposal.kind.forbidden_on_universal() {
        let named = proposal
            .source_type_ids
            .iter()
            .chain(&proposal.target_type_ids)
            .chain(std::iter::once(&subject));
        for id in named {
            if is_universal_id(id) {
                return Ok(Materialized::Refused(format!(
                    "universal type {id} cannot be the subject of a {} operation",
                    proposal.kind.as_str()
                )));
            }
        }
    }

    let mut sources = vec![subject.clone()];
    let mut targets = Vec::new();
    let mut affected: Vec<UnitId> = Vec::new();
    let plan = match proposal.kind {
        OperationKind::Rename => {
            require_live(state, &subject)?;
            let new_alias = proposal
                .new_alias
                .as_deref()
                .map(str::trim)
                .filter(|alias| !alias.is_empty())
                .ok_or_else(|| TaxonError::Validation("rename names no new alias".to_owned()))?;
            MigrationPlan::Rename {
                type_id: subject,
                new_alias: new_alias.to_owned(),
            }
        }
        OperationKind::Hide => {
            require_live(state, &subject)?;
            MigrationPlan::Hide { type_id: subject }
        }
        OperationKind::Promote => {
            let definition = require_live(state, &subject)?;
            if definition.tier != Tier::Emergent {
                return Err(TaxonError::Validation(format!(
                    "only emergent types can be promoted, {subject} is {:?}",
                    definition.tier
                )));
            }
            MigrationPlan::Promote { type_id: subject }
        }
        OperationKind::Demote => {
            let definition = require_live(state, &subject)?;
            if definition.tier != Tier::Domain {
                return Err(TaxonError::Validation(format!(
                    "only domain types can be demoted, {subject} is {:?}",
                    definition.tier
                )));
            }
            MigrationPlan::Demote { type_id: subject }
        }
        OperationKind::Merge => {
            let mut merged: Vec<TypeDefId> = if proposal.source_type_ids.is_empty() {
                vec![subject.clone()]
            } else {
                proposal.source_type_ids.clone()
            };
            let survivor = match proposal.target_type_ids.first() {
                Some(survivor) => survivor.clone(),
                None if merged.len() >= 2 => merged.remove(0),
                None => {
                    return Err(TaxonError::Validation(
                        "merge names no survivor".to_owned(),
                    ));
                }
            };
            merged.retain(|id| id != &survivor);
            merged.dedup();
            if merged.is_empty() {
                return Err(TaxonError::Validation(
                    "merge has nothing to fold into the survivor".to_owned(),
                ));
            }
            require_live(state, &survivor)?;
            for id in &merged {
                require_live(state, id)?;
                affected.extend(state.units.by_type(id).iter().map(|unit| unit.id.clone()));
            }
            sources = merged.clone();
            targets = vec![survivor.clone()];
            MigrationPlan::Merge {
                sources: merged,
                survivor,
            }
        }
        OperationKind::Split => {
            let source = require_live(state, &subject)?;
            let names = new_type_names(proposal);
            if names.len() < 2 {
                return Err(TaxonError::Validation(
                    "split needs at least two target names".to_owned(),
                ));
            }
            let parent = proposal
                .extends
                .clone()
                .or_else(|| source.extends.clone())
                .ok_or_else(|| {
                    TaxonError::Validation(format!("split source {subject} has no parent"))
                })?;
            let mut taken = BTreeSet::new();
            let mut new_types = Vec::new();
            for name in names {
                let id = unique_type_id(state, name, &taken);
                taken.insert(id.clone());
                let mut definition =
                    TypeDefinition::new(id, Tier::Emergent, Some(parent.clone()), name);
                definition.schema = source.schema.clone();
                new_types.push(definition);
            }

            let mut assignments = BTreeMap::new();
            for unit in state.units.by_type(&subject) {
                let assignment = match proposal.assignments.get(&unit.id) {
                    Some(wanted) => match new_types.iter().find(|t| matches_target(t, wanted)) {
                        Some(target) => SplitAssignment::Resolved {
                            target: target.id.clone(),
                        },
                        None => SplitAssignment::Unresolved {
                            reason: format!("assigned to unknown target {wanted}"),
                        },
                    },
                    None => SplitAssignment::Unresolved {
                        reason: "no assignment proposed".to_owned(),
                    },
                };
                affected.push(unit.id.clone());
                assignments.insert(unit.id.clone(), assignment);
            }
            targets = new_types.iter().map(|t| t.id.clone()).collect();
            MigrationPlan::Split {
                source: subject,
                targets: new_types,
                assignments,
            }
        }
        OperationKind::Create => {
            let name = new_type_names(proposal)
                .first()
                .copied()
                .ok_or_else(|| TaxonError::Validation("create names no type".to_owned()))?;
            let parent_id = proposal
                .extends
                .clone()
                .unwrap_or_else(|| event.affected_type_id.clone());
            let parent = require_live(state, &parent_id)?;
            let id = unique_type_id(state, name, &BTreeSet::new());
            let mut definition =
                TypeDefinition::new(id.clone(), Tier::Emergent, Some(parent_id), name);
            definition.schema = parent
                .schema
                .iter()
                .filter(|field| !field.inert)
                .cloned()
                .collect();
            sources = Vec::new();
            targets = vec![id];
            MigrationPlan::Create { definition }
        }
    };

    let rationale = if proposal.rationale.trim().is_empty() {
        fallback_rationale
    } else {
        proposal.rationale.as_str()
    };
    let operation = TypeOperation::new(
        event.project_id.clone(),
        plan,
        sources,
        targets,
        rationale,
        state.version,
    )
    .with_affected_units(affected)
    .with_friction(event.id.clone());
    Ok(Materialized::Operation(operation))
}
