//! Operation routing: auto-apply, pending decision or suggestion.
//!
//! The hard guards run in code before any oracle signal is consulted. No
//! combination of signals can auto-apply an operation that touches a
//! Universal type or reaches beyond the high-impact fraction of a project.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use taxon_protocol::{
    Alternative, AlternativeId, CompensatingOperation, Confidence, Disposition, FrictionEvent,
    GapDiagnosis, MigrationPlan, OperationKind, OperationStatus, PendingDecision, TaxonError,
    TaxonResult, TypeOperation,
};
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Share of a project's units above which an operation is high-impact.
    pub high_impact_fraction: f64,
    /// Operation kinds eligible for auto-apply at all.
    pub auto_apply_kinds: Vec<OperationKind>,
    /// Lowest oracle confidence accepted for auto-apply.
    pub auto_apply_confidence: Confidence,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            high_impact_fraction: 0.25,
            auto_apply_kinds: vec![
                OperationKind::Rename,
                OperationKind::Hide,
                OperationKind::Create,
                OperationKind::Promote,
            ],
            auto_apply_confidence: Confidence::High,
        }
    }
}

impl RoutingPolicy {
    pub fn with_high_impact_fraction(mut self, fraction: f64) -> Self {
        self.high_impact_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_auto_apply_kinds(mut self, kinds: Vec<OperationKind>) -> Self {
        self.auto_apply_kinds = kinds;
        self
    }

    /// Reject settings that would quietly disable a hard guard.
    pub fn validate(&self) -> TaxonResult<()> {
        let fraction = self.high_impact_fraction;
        if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
            return Err(TaxonError::Validation(format!(
                "high_impact_fraction must lie in [0, 1], got {fraction}"
            )));
        }
        Ok(())
    }
}

/// Oracle routing signals. Enum-valued only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingSignals {
    pub suggested: Option<Disposition>,
    pub confidence: Option<Confidence>,
    pub rationale: String,
    /// Extra options beyond the proposal and the status quo.
    pub alternatives: Vec<Alternative>,
}

/// Mechanical facts about the project the operation runs against.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub total_units: usize,
    pub friction: Option<FrictionEvent>,
    pub diagnosis: Option<GapDiagnosis>,
}

/// Why an operation is barred from auto-apply, if it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoApplyBar {
    TouchesUniversal,
    HighImpact,
    KindNotEligible,
    NoCompensation,
}

/// Routing outcome. `AutoApply` cannot be built without its undo.
#[derive(Debug, Clone)]
pub enum Routed {
    AutoApply {
        operation: TypeOperation,
        compensation: CompensatingOperation,
    },
    Pending(Box<PendingDecision>),
    Suggestion {
        operation: TypeOperation,
        rationale: String,
    },
}

impl Routed {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::AutoApply { .. } => Disposition::AutoApply,
            Self::Pending(_) => Disposition::Pending,
            Self::Suggestion { .. } => Disposition::Suggestion,
        }
    }

    pub fn operation(&self) -> &TypeOperation {
        match self {
            Self::AutoApply { operation, .. } | Self::Suggestion { operation, .. } => operation,
            Self::Pending(decision) => &decision.operation,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationRouter {
    policy: RoutingPolicy,
}

impl OperationRouter {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    pub fn is_high_impact(&self, operation: &TypeOperation, total_units: usize) -> bool {
        if total_units == 0 {
            return false;
        }
        let share = operation.affected_unit_ids.len() as f64 / total_units as f64;
        share > self.policy.high_impact_fraction
    }

    /// First hard guard the operation fails, ignoring oracle signals.
    pub fn auto_apply_bar(
        &self,
        operation: &TypeOperation,
        total_units: usize,
        compensation: Option<&CompensatingOperation>,
    ) -> Option<AutoApplyBar> {
        if operation.touches_universal() {
            return Some(AutoApplyBar::TouchesUniversal);
        }
        if self.is_high_impact(operation, total_units) {
            return Some(AutoApplyBar::HighImpact);
        }
        if !self.policy.auto_apply_kinds.contains(&operation.kind) {
            return Some(AutoApplyBar::KindNotEligible);
        }
        match compensation {
            Some(undo) if undo.reverses == operation.id => None,
            _ => Some(AutoApplyBar::NoCompensation),
        }
    }

    #[instrument(
        skip(self, operation, signals, context, compensation),
        fields(project_id = %operation.project_id, operation_id = %operation.id, kind = operation.kind.as_str())
    )]
    pub fn route(
        &self,
        mut operation: TypeOperation,
        signals: RoutingSignals,
        context: RoutingContext,
        compensation: Option<CompensatingOperation>,
    ) -> TaxonResult<Routed> {
        if operation.status != OperationStatus::Proposed {
            return Err(TaxonError::Consistency(format!(
                "operation {} is {:?}, only proposed operations are routed",
                operation.id, operation.status
            )));
        }

        let bar = self.auto_apply_bar(&operation, context.total_units, compensation.as_ref());
        let confident = signals
            .confidence
            .is_some_and(|confidence| confidence >= self.policy.auto_apply_confidence);

        match (bar, signals.suggested) {
            (None, Some(Disposition::AutoApply)) if confident => {
                if let Some(compensation) = compensation {
                    operation.status = OperationStatus::Confirmed;
                    debug!("routed to auto-apply");
                    return Ok(Routed::AutoApply {
                        operation,
                        compensation,
                    });
                }
            }
            (_, Some(Disposition::Suggestion)) if !operation.touches_universal() => {
                debug!(bar = ?bar, "routed as suggestion");
                return Ok(Routed::Suggestion {
                    operation,
                    rationale: signals.rationale,
                });
            }
            _ => {}
        }

        debug!(bar = ?bar, "routed to pending decision");
        operation.status = OperationStatus::Pending;
        Ok(Routed::Pending(Box::new(build_pending(
            operation, signals, context,
        ))))
    }
}

/// Assemble a pending decision: the proposal, the status quo, then any
/// extra oracle alternatives.
pub fn build_pending(
    operation: TypeOperation,
    signals: RoutingSignals,
    context: RoutingContext,
) -> PendingDecision {
    let (commits_to, forecloses) = describe(&operation);
    let mut alternatives = vec![
        Alternative {
            id: AlternativeId::proposed(),
            label: format!("Apply {}", operation.kind.as_str()),
            operation: Some(operation.clone()),
            commits_to: commits_to.clone(),
            forecloses: forecloses.clone(),
        },
        Alternative {
            id: AlternativeId::status_quo(),
            label: "Keep the current taxonomy".to_owned(),
            operation: None,
            commits_to: format!("the taxonomy stays as it is; {forecloses}"),
            forecloses: commits_to,
        },
    ];
    for extra in signals.alternatives {
        if extra.id == AlternativeId::proposed() || extra.id == AlternativeId::status_quo() {
            continue;
        }
        if extra.commits_to.trim().is_empty() || extra.forecloses.trim().is_empty() {
            continue;
        }
        alternatives.push(extra);
    }
    PendingDecision {
        operation,
        alternatives,
        friction: context.friction,
        diagnosis: context.diagnosis,
        oracle_rationale: signals.rationale,
        opened_at: Utc::now(),
        resolution: None,
        schema_version: 1,
    }
}

/// What applying the operation commits to, and what it forecloses.
pub fn describe(operation: &TypeOperation) -> (String, String) {
    match &operation.migration_plan {
        MigrationPlan::Rename { type_id, new_alias } => (
            format!("type {type_id} is displayed as \"{new_alias}\"; earlier names stay as aliases"),
            format!("the current display name of {type_id} as its primary label"),
        ),
        MigrationPlan::Hide { type_id } => (
            format!("type {type_id} is no longer offered for new units; existing units keep it"),
            format!("assigning new units to {type_id}"),
        ),
        MigrationPlan::Merge { sources, survivor } => (
            format!(
                "units of {} move to {survivor}, whose schema becomes the field union",
                join(sources)
            ),
            format!("treating {} as distinct types", join(sources)),
        ),
        MigrationPlan::Split {
            source, targets, ..
        } => {
            let names: Vec<&str> = targets.iter().map(|t| t.display_name()).collect();
            (
                format!(
                    "units of {source} are divided among {}; unassigned units stay on the hidden original",
                    names.join(", ")
                ),
                format!("a single undivided {source} type"),
            )
        }
        MigrationPlan::Promote { type_id } => (
            format!("{type_id} becomes a Domain type with a frozen schema"),
            format!("further schema drift on {type_id} without an explicit demotion"),
        ),
        MigrationPlan::Create { definition } => (
            format!(
                "new type {} extending {}",
                definition.display_name(),
                definition
                    .extends
                    .as_ref()
                    .map(|parent| parent.as_str())
                    .unwrap_or("nothing")
            ),
            "classifying these units only under existing types".to_owned(),
        ),
        MigrationPlan::Demote { type_id } => (
            format!("{type_id} returns to Emergent with an unfrozen schema"),
            format!("{type_id} as a stable Domain type"),
        ),
    }
}

fn join(ids: &[taxon_protocol::TypeDefId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" and ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use taxon_protocol::{OperationId, ProjectId, TypeDefId, UnitId, is_universal_id};

    fn operation(plan: MigrationPlan, sources: Vec<&str>, units: usize) -> TypeOperation {
        TypeOperation::new(
            ProjectId::from_string("p"),
            plan,
            sources.into_iter().map(TypeDefId::from_string).collect(),
            vec![],
            "test",
            1,
        )
        .with_affected_units((0..units).map(|i| UnitId::from_string(format!("u{i}"))).collect())
    }

    fn undo_for(operation: &TypeOperation) -> CompensatingOperation {
        CompensatingOperation {
            id: OperationId::default(),
            reverses: operation.id.clone(),
            restore_types: vec![],
            remove_types: vec![],
            restore_units: vec![],
            expected_unit_versions: BTreeMap::new(),
        }
    }

    fn eager() -> RoutingSignals {
        RoutingSignals {
            suggested: Some(Disposition::AutoApply),
            confidence: Some(Confidence::High),
            rationale: "obvious".into(),
            alternatives: vec![],
        }
    }

    fn rename(type_id: &str, units: usize) -> TypeOperation {
        operation(
            MigrationPlan::Rename {
                type_id: TypeDefId::from_string(type_id),
                new_alias: "New".into(),
            },
            vec![type_id],
            units,
        )
    }

    fn context(total_units: usize) -> RoutingContext {
        RoutingContext {
            total_units,
            ..RoutingContext::default()
        }
    }

    #[test]
    fn low_impact_rename_auto_applies_with_undo() {
        let router = OperationRouter::default();
        let op = rename("market_force", 1);
        let undo = undo_for(&op);
        let routed = router.route(op, eager(), context(10), Some(undo)).unwrap();
        assert_eq!(routed.disposition(), Disposition::AutoApply);
        assert_eq!(routed.operation().status, OperationStatus::Confirmed);
    }

    #[test]
    fn missing_undo_degrades_to_pending() {
        let router = OperationRouter::default();
        let op = rename("market_force", 1);
        let routed = router.route(op, eager(), context(10), None).unwrap();
        assert_eq!(routed.disposition(), Disposition::Pending);
    }

    #[test]
    fn undo_for_another_operation_does_not_count() {
        let router = OperationRouter::default();
        let op = rename("market_force", 1);
        let other = undo_for(&rename("market_force", 1));
        assert_eq!(
            router.auto_apply_bar(&op, 10, Some(&other)),
            Some(AutoApplyBar::NoCompensation)
        );
    }

    #[test]
    fn high_impact_never_auto_applies() {
        let router = OperationRouter::default();
        let op = rename("market_force", 3);
        let undo = undo_for(&op);
        assert_eq!(
            router.auto_apply_bar(&op, 10, Some(&undo)),
            Some(AutoApplyBar::HighImpact)
        );
        let routed = router.route(op, eager(), context(10), Some(undo)).unwrap();
        assert_eq!(routed.disposition(), Disposition::Pending);
    }

    #[test]
    fn split_is_not_auto_eligible_by_default() {
        let router = OperationRouter::default();
        let op = operation(
            MigrationPlan::Split {
                source: TypeDefId::from_string("market_force"),
                targets: vec![],
                assignments: BTreeMap::new(),
            },
            vec!["market_force"],
            1,
        );
        let undo = undo_for(&op);
        assert_eq!(
            router.auto_apply_bar(&op, 100, Some(&undo)),
            Some(AutoApplyBar::KindNotEligible)
        );
    }

    #[test]
    fn pending_always_offers_proposal_and_status_quo() {
        let router = OperationRouter::default();
        let op = rename("tension", 0);
        let routed = router
            .route(op, RoutingSignals::default(), context(4), None)
            .unwrap();
        let Routed::Pending(decision) = routed else {
            panic!("expected pending");
        };
        assert!(decision.alternatives.len() >= 2);
        assert!(decision.alternative(&AlternativeId::proposed()).is_some());
        let status_quo = decision.alternative(&AlternativeId::status_quo()).unwrap();
        assert!(status_quo.operation.is_none());
        assert!(
            decision
                .alternatives
                .iter()
                .all(|alt| !alt.commits_to.is_empty() && !alt.forecloses.is_empty())
        );
    }

    #[test]
    fn suggestion_signal_is_honoured_for_non_universal() {
        let router = OperationRouter::default();
        let signals = RoutingSignals {
            suggested: Some(Disposition::Suggestion),
            ..RoutingSignals::default()
        };
        let routed = router
            .route(rename("market_force", 1), signals.clone(), context(10), None)
            .unwrap();
        assert_eq!(routed.disposition(), Disposition::Suggestion);
        let routed = router
            .route(rename("agent", 1), signals, context(10), None)
            .unwrap();
        assert_eq!(routed.disposition(), Disposition::Pending);
    }

    #[test]
    fn policy_rejects_fraction_outside_unit_interval() {
        let mut policy = RoutingPolicy::default();
        assert!(policy.validate().is_ok());
        policy.high_impact_fraction = 1.5;
        assert!(matches!(policy.validate(), Err(TaxonError::Validation(_))));
        policy.high_impact_fraction = f64::NAN;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn only_proposed_operations_are_routed() {
        let router = OperationRouter::default();
        let mut op = rename("market_force", 1);
        op.status = OperationStatus::Applied;
        assert!(router.route(op, eager(), context(10), None).is_err());
    }

    #[test]
    fn randomized_universal_operations_never_auto_apply() {
        let mut rng = StdRng::seed_from_u64(0x7a_c0);
        let pool = [
            "concept",
            "tension",
            "agent",
            "market_force",
            "rate_shock",
            "moat",
            "founder",
        ];
        for _ in 0..2_000 {
            let kind = OperationKind::ALL[rng.gen_range(0..OperationKind::ALL.len())];
            let policy = RoutingPolicy::default()
                .with_auto_apply_kinds(OperationKind::ALL.to_vec())
                .with_high_impact_fraction(rng.gen_range(0.0..=1.0));
            let router = OperationRouter::new(policy);

            let a = TypeDefId::from_string(pool[rng.gen_range(0..pool.len())]);
            let b = TypeDefId::from_string(pool[rng.gen_range(0..pool.len())]);
            let plan = match kind {
                OperationKind::Rename => MigrationPlan::Rename {
                    type_id: a.clone(),
                    new_alias: "x".into(),
                },
                OperationKind::Hide => MigrationPlan::Hide { type_id: a.clone() },
                OperationKind::Merge => MigrationPlan::Merge {
                    sources: vec![a.clone()],
                    survivor: b.clone(),
                },
                OperationKind::Split => MigrationPlan::Split {
                    source: a.clone(),
                    targets: vec![],
                    assignments: BTreeMap::new(),
                },
                OperationKind::Promote => MigrationPlan::Promote { type_id: a.clone() },
                OperationKind::Create => MigrationPlan::Create {
                    definition: taxon_protocol::TypeDefinition::new(
                        a.clone(),
                        taxon_protocol::Tier::Domain,
                        Some(b.clone()),
                        "x",
                    ),
                },
                OperationKind::Demote => MigrationPlan::Demote { type_id: a.clone() },
            };
            let mut op = TypeOperation::new(
                ProjectId::from_string("p"),
                plan,
                if rng.gen_bool(0.7) { vec![a.clone()] } else { vec![] },
                if rng.gen_bool(0.5) { vec![b.clone()] } else { vec![] },
                "fuzz",
                1,
            );
            let units = rng.gen_range(0..5);
            op = op.with_affected_units(
                (0..units).map(|i| UnitId::from_string(format!("u{i}"))).collect(),
            );
            let undo = rng.gen_bool(0.9).then(|| undo_for(&op));
            let signals = RoutingSignals {
                suggested: Some(match rng.gen_range(0..3) {
                    0 => Disposition::AutoApply,
                    1 => Disposition::Pending,
                    _ => Disposition::Suggestion,
                }),
                confidence: Some(Confidence::High),
                rationale: "fuzz".into(),
                alternatives: vec![],
            };
            let touches = op
                .source_type_ids
                .iter()
                .chain(op.target_type_ids.iter())
                .chain(op.migration_plan.type_ids().iter())
                .any(is_universal_id);

            let routed = router
                .route(op, signals, context(rng.gen_range(0..50)), undo)
                .unwrap();
            if touches {
                assert_ne!(routed.disposition(), Disposition::AutoApply);
                assert_ne!(routed.disposition(), Disposition::Suggestion);
            }
        }
    }
}
