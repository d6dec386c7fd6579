//! Type operations, routing dispositions, pending decisions and migration
//! records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::friction::{FrictionEvent, GapDiagnosis};
use crate::ids::{
    AlternativeId, FrictionId, GenesisId, MigrationId, OperationId, ProjectId, SnapshotRef,
    TypeDefId, UnitId,
};
use crate::taxonomy::{TypeDefinition, default_schema_version, is_universal_id};
use crate::unit::Unit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Rename,
    Hide,
    Merge,
    Split,
    Promote,
    Create,
    Demote,
}

impl OperationKind {
    pub const ALL: [OperationKind; 7] = [
        Self::Rename,
        Self::Hide,
        Self::Merge,
        Self::Split,
        Self::Promote,
        Self::Create,
        Self::Demote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rename => "rename",
            Self::Hide => "hide",
            Self::Merge => "merge",
            Self::Split => "split",
            Self::Promote => "promote",
            Self::Create => "create",
            Self::Demote => "demote",
        }
    }

    /// Kinds that a Universal type may never be the subject of.
    pub fn forbidden_on_universal(self) -> bool {
        matches!(
            self,
            Self::Merge | Self::Split | Self::Demote | Self::Hide | Self::Promote
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Proposed,
    Pending,
    Confirmed,
    Applied,
    Rejected,
}

/// Target assignment for one instance of a split type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SplitAssignment {
    Resolved { target: TypeDefId },
    Unresolved { reason: String },
}

/// Kind-specific migration payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum MigrationPlan {
    Rename {
        type_id: TypeDefId,
        new_alias: String,
    },
    Hide {
        type_id: TypeDefId,
    },
    Merge {
        sources: Vec<TypeDefId>,
        survivor: TypeDefId,
    },
    Split {
        source: TypeDefId,
        targets: Vec<TypeDefinition>,
        assignments: BTreeMap<UnitId, SplitAssignment>,
    },
    Promote {
        type_id: TypeDefId,
    },
    Create {
        definition: TypeDefinition,
    },
    Demote {
        type_id: TypeDefId,
    },
}

impl MigrationPlan {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Rename { .. } => OperationKind::Rename,
            Self::Hide { .. } => OperationKind::Hide,
            Self::Merge { .. } => OperationKind::Merge,
            Self::Split { .. } => OperationKind::Split,
            Self::Promote { .. } => OperationKind::Promote,
            Self::Create { .. } => OperationKind::Create,
            Self::Demote { .. } => OperationKind::Demote,
        }
    }

    /// Every type id the plan reads or writes, sorted.
    pub fn type_ids(&self) -> Vec<TypeDefId> {
        let mut out = match self {
            Self::Rename { type_id, .. }
            | Self::Hide { type_id }
            | Self::Promote { type_id }
            | Self::Demote { type_id } => vec![type_id.clone()],
            Self::Merge { sources, survivor } => {
                let mut ids = sources.clone();
                ids.push(survivor.clone());
                ids
            }
            Self::Split {
                source, targets, ..
            } => std::iter::once(source.clone())
                .chain(targets.iter().map(|target| target.id.clone()))
                .collect(),
            Self::Create { definition } => vec![definition.id.clone()],
        };
        out.sort();
        out.dedup();
        out
    }

    /// Definitions the plan brings into the registry.
    pub fn created_types_mut(&mut self) -> Vec<&mut TypeDefinition> {
        match self {
            Self::Create { definition } => vec![definition],
            Self::Split { targets, .. } => targets.iter_mut().collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeOperation {
    pub id: OperationId,
    pub project_id: ProjectId,
    pub kind: OperationKind,
    pub source_type_ids: Vec<TypeDefId>,
    pub target_type_ids: Vec<TypeDefId>,
    pub rationale: String,
    pub affected_unit_ids: Vec<UnitId>,
    pub migration_plan: MigrationPlan,
    pub status: OperationStatus,
    /// Registry version the operation was diagnosed against.
    pub based_on_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friction_id: Option<FrictionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_id: Option<MigrationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reissued_from: Option<OperationId>,
    /// Set when the operation is applied. A reissue carries its original's
    /// until it gets its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_id: Option<GenesisId>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

impl TypeOperation {
    pub fn new(
        project_id: ProjectId,
        migration_plan: MigrationPlan,
        source_type_ids: Vec<TypeDefId>,
        target_type_ids: Vec<TypeDefId>,
        rationale: impl Into<String>,
        based_on_version: u64,
    ) -> Self {
        Self {
            id: OperationId::default(),
            project_id,
            kind: migration_plan.kind(),
            source_type_ids,
            target_type_ids,
            rationale: rationale.into(),
            affected_unit_ids: Vec::new(),
            migration_plan,
            status: OperationStatus::Proposed,
            based_on_version,
            friction_id: None,
            migration_id: None,
            reissued_from: None,
            genesis_id: None,
            created_at: Utc::now(),
            schema_version: default_schema_version(),
        }
    }

    pub fn with_affected_units(mut self, units: Vec<UnitId>) -> Self {
        self.affected_unit_ids = units;
        self
    }

    pub fn with_friction(mut self, friction_id: FrictionId) -> Self {
        self.friction_id = Some(friction_id);
        self
    }

    fn listed_type_ids(&self) -> Vec<TypeDefId> {
        let mut out: Vec<TypeDefId> = self
            .source_type_ids
            .iter()
            .chain(self.target_type_ids.iter())
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Every type id the operation reads or writes: the plan's ids plus
    /// anything the source and target lists name.
    pub fn touched_type_ids(&self) -> Vec<TypeDefId> {
        let mut out = self.migration_plan.type_ids();
        out.extend(self.listed_type_ids());
        out.sort();
        out.dedup();
        out
    }

    /// Whether the source and target lists name exactly the plan's types.
    pub fn lists_match_plan(&self) -> bool {
        self.listed_type_ids() == self.migration_plan.type_ids()
    }

    pub fn touches_universal(&self) -> bool {
        self.touched_type_ids().iter().any(is_universal_id)
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Proposed | OperationStatus::Pending | OperationStatus::Confirmed
        )
    }

    /// Fresh, confirmed copy of this operation. Applied operations are
    /// immutable, so reapplying after an undo goes through a reissue.
    pub fn reissue(&self, based_on_version: u64) -> Self {
        let mut copy = self.clone();
        copy.id = OperationId::default();
        copy.status = OperationStatus::Confirmed;
        copy.migration_id = None;
        copy.reissued_from = Some(self.id.clone());
        copy.based_on_version = based_on_version;
        copy.created_at = Utc::now();
        copy
    }

    /// Units whose rows this operation may touch, or overlapping types.
    pub fn overlaps(&self, other: &TypeOperation) -> bool {
        let mine = self.touched_type_ids();
        if other.touched_type_ids().iter().any(|id| mine.contains(id)) {
            return true;
        }
        other
            .affected_unit_ids
            .iter()
            .any(|unit| self.affected_unit_ids.contains(unit))
    }
}

/// Routing outcome class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    AutoApply,
    Pending,
    Suggestion,
}

/// One option inside a pending decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub id: AlternativeId,
    pub label: String,
    /// `None` keeps the status quo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<TypeOperation>,
    pub commits_to: String,
    pub forecloses: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Applied { migration_id: MigrationId },
    KeptStatusQuo,
    Withdrawn,
    Superseded { by: OperationId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResolution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_id: Option<AlternativeId>,
    pub actor: String,
    pub outcome: ResolutionOutcome,
    pub resolved_at: DateTime<Utc>,
}

/// A durable, human-facing trade-off decision. Everything needed to present
/// it is stored here; nothing is re-derived from the oracle on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub operation: TypeOperation,
    pub alternatives: Vec<Alternative>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friction: Option<FrictionEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<GapDiagnosis>,
    pub oracle_rationale: String,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<DecisionResolution>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

impl PendingDecision {
    pub fn alternative(&self, id: &AlternativeId) -> Option<&Alternative> {
        self.alternatives.iter().find(|alt| &alt.id == id)
    }

    pub fn is_open(&self) -> bool {
        self.resolution.is_none()
    }
}

/// Undo for an applied operation, built before the operation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensatingOperation {
    pub id: OperationId,
    pub reverses: OperationId,
    /// Before-images of every definition the operation changes.
    pub restore_types: Vec<TypeDefinition>,
    /// Types that did not exist before the operation.
    pub remove_types: Vec<TypeDefId>,
    /// Before-images of every unit row the operation changes.
    pub restore_units: Vec<Unit>,
    /// Unit versions the operation will leave behind; a revert refuses to
    /// clobber later edits.
    pub expected_unit_versions: BTreeMap<UnitId, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepointedUnit {
    pub unit_id: UnitId,
    pub from: TypeDefId,
    pub to: TypeDefId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedUnit {
    pub unit_id: UnitId,
    pub left_on: TypeDefId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: MigrationId,
    pub operation_id: OperationId,
    pub project_id: ProjectId,
    pub kind: OperationKind,
    pub before_snapshot_ref: SnapshotRef,
    pub after_snapshot_ref: SnapshotRef,
    pub applied_at: DateTime<Utc>,
    pub reversible: bool,
    pub version_before: u64,
    pub version_after: u64,
    #[serde(default)]
    pub repointed: Vec<RepointedUnit>,
    #[serde(default)]
    pub unresolved: Vec<UnresolvedUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensatingOperation>,
    /// Set when this record is itself the application of an undo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses: Option<MigrationId>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rename(type_id: &str) -> TypeOperation {
        TypeOperation::new(
            ProjectId::from_string("p"),
            MigrationPlan::Rename {
                type_id: TypeDefId::from_string(type_id),
                new_alias: "New".into(),
            },
            vec![TypeDefId::from_string(type_id)],
            vec![],
            "clarify",
            1,
        )
    }

    #[test]
    fn kind_follows_plan() {
        assert_eq!(rename("x").kind, OperationKind::Rename);
    }

    #[test]
    fn touches_universal_detects_roots() {
        assert!(rename("tension").touches_universal());
        assert!(!rename("market_force").touches_universal());
    }

    #[test]
    fn plan_ids_count_even_when_lists_are_empty() {
        let merge = TypeOperation::new(
            ProjectId::from_string("p"),
            MigrationPlan::Merge {
                sources: vec![TypeDefId::from_string("moat")],
                survivor: TypeDefId::from_string("concept"),
            },
            vec![],
            vec![],
            "fold",
            1,
        );
        assert!(merge.touches_universal());
        assert!(!merge.lists_match_plan());
        assert_eq!(
            merge.touched_type_ids(),
            vec![TypeDefId::from_string("concept"), TypeDefId::from_string("moat")]
        );
        assert!(merge.overlaps(&rename("moat")));
        assert!(rename("moat").lists_match_plan());
    }

    #[test]
    fn created_types_cover_create_and_split_targets() {
        let id = TypeDefId::from_string("macro_force");
        let mut split = MigrationPlan::Split {
            source: TypeDefId::from_string("market_force"),
            targets: vec![TypeDefinition::new(
                id.clone(),
                crate::taxonomy::Tier::Emergent,
                None,
                "Macro Force",
            )],
            assignments: BTreeMap::new(),
        };
        for definition in split.created_types_mut() {
            definition.genesis_id = Some(GenesisId::from_string("g1"));
        }
        assert_eq!(split.created_types_mut().len(), 1);
        assert!(split.created_types_mut()[0].genesis_id.is_some());
        let mut hide = MigrationPlan::Hide { type_id: id };
        assert!(hide.created_types_mut().is_empty());
    }

    #[test]
    fn reissue_keeps_the_original_genesis_as_parent() {
        let mut op = rename("x");
        op.genesis_id = Some(GenesisId::from_string("g1"));
        assert_eq!(op.reissue(3).genesis_id, op.genesis_id);
    }

    #[test]
    fn reissue_creates_fresh_confirmed_copy() {
        let mut op = rename("x");
        op.status = OperationStatus::Applied;
        op.migration_id = Some(MigrationId::from_string("m1"));
        let again = op.reissue(7);
        assert_ne!(again.id, op.id);
        assert_eq!(again.status, OperationStatus::Confirmed);
        assert_eq!(again.reissued_from.as_ref(), Some(&op.id));
        assert_eq!(again.based_on_version, 7);
        assert!(again.migration_id.is_none());
    }

    #[test]
    fn overlap_by_type_or_unit() {
        let a = rename("x");
        let b = rename("x");
        let c = rename("y").with_affected_units(vec![UnitId::from_string("u1")]);
        let d = rename("z").with_affected_units(vec![UnitId::from_string("u1")]);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(c.overlaps(&d));
    }

    #[test]
    fn universal_guard_kinds() {
        assert!(OperationKind::Merge.forbidden_on_universal());
        assert!(OperationKind::Split.forbidden_on_universal());
        assert!(OperationKind::Demote.forbidden_on_universal());
        assert!(!OperationKind::Rename.forbidden_on_universal());
    }
}
