//! Ledger entry taxonomy.
//!
//! Every durable fact the engine produces is an append-only [`LedgerRecord`]
//! in its project's ledger: provenance, friction, decisions, migrations,
//! pipeline transitions and promotions. Replaying the ledger rebuilds pending
//! decisions and the promotion ledger after a restart.
//!
//! Forward-compatible: unknown `"type"` tags deserialize into
//! `Custom { event_type, data }` instead of failing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::friction::{FrictionEvent, FrictionStatus, GapDiagnosis};
use crate::ids::*;
use crate::operation::{DecisionResolution, MigrationRecord, PendingDecision, TypeOperation};
use crate::promotion::{Abstraction, DemotionEntry, PromotionEntry, PromotionSubject, TestResult};
use crate::provenance::GenesisRecord;
use crate::taxonomy::{TypeDefinition, default_schema_version};
use crate::unit::PipelineStage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub entry_id: EntryId,
    pub project_id: ProjectId,
    pub sequence: SeqNo,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EntryId>,
    pub kind: LedgerEntry,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

impl LedgerRecord {
    pub fn new(project_id: ProjectId, sequence: SeqNo, kind: LedgerEntry) -> Self {
        Self {
            entry_id: EntryId::default(),
            project_id,
            sequence,
            recorded_at: Utc::now(),
            causation_id: None,
            kind,
            schema_version: default_schema_version(),
        }
    }
}

/// Discriminated union of all ledger entries.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
#[serde(tag = "type")]
pub enum LedgerEntry {
    // ── Project lifecycle ──
    ProjectCreated {
        doctrine_types: usize,
    },

    // ── Provenance ──
    GenesisRecorded {
        record: GenesisRecord,
    },

    // ── Units and pipeline ──
    UnitRecorded {
        unit_id: UnitId,
        type_id: TypeDefId,
        version: u32,
    },
    StageAdvanced {
        unit_id: UnitId,
        from: PipelineStage,
        to: PipelineStage,
    },
    TestRecorded {
        result: TestResult,
    },
    AbstractionRecorded {
        abstraction: Abstraction,
    },

    // ── Friction and diagnosis ──
    FrictionDetected {
        event: FrictionEvent,
    },
    FrictionStatusChanged {
        friction_id: FrictionId,
        status: FrictionStatus,
    },
    DiagnosisRecorded {
        diagnosis: GapDiagnosis,
    },

    // ── Decisions and migrations ──
    DecisionOpened {
        decision: PendingDecision,
    },
    DecisionResolved {
        operation_id: OperationId,
        resolution: DecisionResolution,
    },
    SuggestionRecorded {
        operation: TypeOperation,
    },
    OperationRejected {
        operation_id: OperationId,
        reason: String,
    },
    MigrationApplied {
        record: MigrationRecord,
        operation: TypeOperation,
    },
    MigrationReverted {
        record: MigrationRecord,
    },
    /// A logged migration whose state swap failed; it never took effect.
    MigrationAborted {
        migration_id: MigrationId,
        reason: String,
    },

    // ── Promotion ledger ──
    Promoted {
        entry: PromotionEntry,
    },
    Demoted {
        entry: DemotionEntry,
    },
    PromotionFlagged {
        unit_id: UnitId,
        duplicate_of: Vec<PromotionSubject>,
        rationale: String,
    },
    DoctrinePublished {
        definition: TypeDefinition,
    },
    DoctrineRetracted {
        type_id: TypeDefId,
    },

    // ── Cycle bookkeeping ──
    CycleCompleted {
        friction_events: usize,
        proposals: usize,
        auto_applied: usize,
        registry_version: u64,
    },
    OracleUnavailable {
        stage: String,
        message: String,
    },

    // ── Forward-compatible catch-all ──
    Custom {
        event_type: String,
        data: serde_json::Value,
    },
}

impl LedgerEntry {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProjectCreated { .. } => "project_created",
            Self::GenesisRecorded { .. } => "genesis_recorded",
            Self::UnitRecorded { .. } => "unit_recorded",
            Self::StageAdvanced { .. } => "stage_advanced",
            Self::TestRecorded { .. } => "test_recorded",
            Self::AbstractionRecorded { .. } => "abstraction_recorded",
            Self::FrictionDetected { .. } => "friction_detected",
            Self::FrictionStatusChanged { .. } => "friction_status_changed",
            Self::DiagnosisRecorded { .. } => "diagnosis_recorded",
            Self::DecisionOpened { .. } => "decision_opened",
            Self::DecisionResolved { .. } => "decision_resolved",
            Self::SuggestionRecorded { .. } => "suggestion_recorded",
            Self::OperationRejected { .. } => "operation_rejected",
            Self::MigrationApplied { .. } => "migration_applied",
            Self::MigrationReverted { .. } => "migration_reverted",
            Self::MigrationAborted { .. } => "migration_aborted",
            Self::Promoted { .. } => "promoted",
            Self::Demoted { .. } => "demoted",
            Self::PromotionFlagged { .. } => "promotion_flagged",
            Self::DoctrinePublished { .. } => "doctrine_published",
            Self::DoctrineRetracted { .. } => "doctrine_retracted",
            Self::CycleCompleted { .. } => "cycle_completed",
            Self::OracleUnavailable { .. } => "oracle_unavailable",
            Self::Custom { .. } => "custom",
        }
    }
}

// ─── Forward-compatible deserializer ───────────────────────────────

/// Internal helper enum for the forward-compatible deserializer.
/// Mirrors LedgerEntry exactly but derives Deserialize.
#[derive(Deserialize)]
#[serde(tag = "type")]
enum LedgerEntryKnown {
    ProjectCreated {
        doctrine_types: usize,
    },
    GenesisRecorded {
        record: GenesisRecord,
    },
    UnitRecorded {
        unit_id: UnitId,
        type_id: TypeDefId,
        version: u32,
    },
    StageAdvanced {
        unit_id: UnitId,
        from: PipelineStage,
        to: PipelineStage,
    },
    TestRecorded {
        result: TestResult,
    },
    AbstractionRecorded {
        abstraction: Abstraction,
    },
    FrictionDetected {
        event: FrictionEvent,
    },
    FrictionStatusChanged {
        friction_id: FrictionId,
        status: FrictionStatus,
    },
    DiagnosisRecorded {
        diagnosis: GapDiagnosis,
    },
    DecisionOpened {
        decision: PendingDecision,
    },
    DecisionResolved {
        operation_id: OperationId,
        resolution: DecisionResolution,
    },
    SuggestionRecorded {
        operation: TypeOperation,
    },
    OperationRejected {
        operation_id: OperationId,
        reason: String,
    },
    MigrationApplied {
        record: MigrationRecord,
        operation: TypeOperation,
    },
    MigrationReverted {
        record: MigrationRecord,
    },
    MigrationAborted {
        migration_id: MigrationId,
        reason: String,
    },
    Promoted {
        entry: PromotionEntry,
    },
    Demoted {
        entry: DemotionEntry,
    },
    PromotionFlagged {
        unit_id: UnitId,
        duplicate_of: Vec<PromotionSubject>,
        rationale: String,
    },
    DoctrinePublished {
        definition: TypeDefinition,
    },
    DoctrineRetracted {
        type_id: TypeDefId,
    },
    CycleCompleted {
        friction_events: usize,
        proposals: usize,
        auto_applied: usize,
        registry_version: u64,
    },
    OracleUnavailable {
        stage: String,
        message: String,
    },
    Custom {
        event_type: String,
        data: serde_json::Value,
    },
}

impl<'de> Deserialize<'de> for LedgerEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        match serde_json::from_value::<LedgerEntryKnown>(raw.clone()) {
            Ok(known) => Ok(known.into()),
            Err(_) => {
                let event_type = raw
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    .to_string();
                let mut data = raw;
                if let Some(obj) = data.as_object_mut() {
                    obj.remove("type");
                }
                Ok(LedgerEntry::Custom { event_type, data })
            }
        }
    }
}

impl From<LedgerEntryKnown> for LedgerEntry {
    fn from(k: LedgerEntryKnown) -> Self {
        match k {
            LedgerEntryKnown::ProjectCreated { doctrine_types } => {
                Self::ProjectCreated { doctrine_types }
            }
            LedgerEntryKnown::GenesisRecorded { record } => Self::GenesisRecorded { record },
            LedgerEntryKnown::UnitRecorded {
                unit_id,
                type_id,
                version,
            } => Self::UnitRecorded {
                unit_id,
                type_id,
                version,
            },
            LedgerEntryKnown::StageAdvanced { unit_id, from, to } => {
                Self::StageAdvanced { unit_id, from, to }
            }
            LedgerEntryKnown::TestRecorded { result } => Self::TestRecorded { result },
            LedgerEntryKnown::AbstractionRecorded { abstraction } => {
                Self::AbstractionRecorded { abstraction }
            }
            LedgerEntryKnown::FrictionDetected { event } => Self::FrictionDetected { event },
            LedgerEntryKnown::FrictionStatusChanged {
                friction_id,
                status,
            } => Self::FrictionStatusChanged {
                friction_id,
                status,
            },
            LedgerEntryKnown::DiagnosisRecorded { diagnosis } => {
                Self::DiagnosisRecorded { diagnosis }
            }
            LedgerEntryKnown::DecisionOpened { decision } => Self::DecisionOpened { decision },
            LedgerEntryKnown::DecisionResolved {
                operation_id,
                resolution,
            } => Self::DecisionResolved {
                operation_id,
                resolution,
            },
            LedgerEntryKnown::SuggestionRecorded { operation } => {
                Self::SuggestionRecorded { operation }
            }
            LedgerEntryKnown::OperationRejected {
                operation_id,
                reason,
            } => Self::OperationRejected {
                operation_id,
                reason,
            },
            LedgerEntryKnown::MigrationApplied { record, operation } => {
                Self::MigrationApplied { record, operation }
            }
            LedgerEntryKnown::MigrationReverted { record } => Self::MigrationReverted { record },
            LedgerEntryKnown::MigrationAborted {
                migration_id,
                reason,
            } => Self::MigrationAborted {
                migration_id,
                reason,
            },
            LedgerEntryKnown::Promoted { entry } => Self::Promoted { entry },
            LedgerEntryKnown::Demoted { entry } => Self::Demoted { entry },
            LedgerEntryKnown::PromotionFlagged {
                unit_id,
                duplicate_of,
                rationale,
            } => Self::PromotionFlagged {
                unit_id,
                duplicate_of,
                rationale,
            },
            LedgerEntryKnown::DoctrinePublished { definition } => {
                Self::DoctrinePublished { definition }
            }
            LedgerEntryKnown::DoctrineRetracted { type_id } => Self::DoctrineRetracted { type_id },
            LedgerEntryKnown::CycleCompleted {
                friction_events,
                proposals,
                auto_applied,
                registry_version,
            } => Self::CycleCompleted {
                friction_events,
                proposals,
                auto_applied,
                registry_version,
            },
            LedgerEntryKnown::OracleUnavailable { stage, message } => {
                Self::OracleUnavailable { stage, message }
            }
            LedgerEntryKnown::Custom { event_type, data } => Self::Custom { event_type, data },
        }
    }
}
