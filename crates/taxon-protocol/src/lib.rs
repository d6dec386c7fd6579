//! # taxon-protocol: shared contract for the taxonomy engine
//!
//! Types, ledger entry taxonomy and port traits shared by every taxon crate.
//! It carries no runtime dependency (no tokio, no filesystem) so it can be
//! used as a pure contract crate by oracles and storage backends.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (ProjectId, UnitId, TypeDefId, SnapshotRef, etc.)
//! - [`taxonomy`]: Tier, TypeDefinition, FieldSpec and the three Universal types
//! - [`unit`]: Unit, UnitStatus, PipelineStage
//! - [`provenance`]: GenesisRecord, SourcePool
//! - [`evidence`]: EvidencePackage and its mechanical signals
//! - [`friction`]: FrictionEvent, GapKind, GapDiagnosis
//! - [`operation`]: TypeOperation, MigrationPlan, PendingDecision, MigrationRecord
//! - [`promotion`]: TestResult, Abstraction, promotion ledger entries
//! - [`judge`]: Oracle contract (JudgeRequest / JudgeReply, version 1)
//! - [`state`]: ProjectSnapshot persisted per project
//! - [`event`]: LedgerRecord + LedgerEntry (forward-compatible)
//! - [`ports`]: Runtime boundary ports (judge, project store, ledger)
//! - [`error`]: TaxonError, TaxonResult

pub mod error;
pub mod event;
pub mod evidence;
pub mod friction;
pub mod ids;
pub mod judge;
pub mod operation;
pub mod ports;
pub mod promotion;
pub mod provenance;
pub mod state;
pub mod taxonomy;
pub mod unit;

// Re-export the most commonly used types at the crate root.
pub use error::{TaxonError, TaxonResult};
pub use event::{LedgerEntry, LedgerRecord};
pub use evidence::{
    ClusterSeparability, ContentSample, EvidencePackage, FieldOverlap, TypeNameOverride, TypeUsage,
};
pub use friction::{
    CoinRequest, EvidenceRef, FrictionEvent, FrictionStatus, GapDiagnosis, GapKind,
    RecommendedAction, Severity, SignalType,
};
pub use ids::{
    AlternativeId, EntryId, EvaluationId, FrictionId, GenesisId, MigrationId, OperationId,
    ProjectId, SeqNo, SnapshotRef, TypeDefId, UnitId,
};
pub use judge::{
    AssessmentKind, Confidence, Grade, JUDGE_CONTRACT_VERSION, JudgeReply, JudgeRequest,
    JudgeVerdict, ProposedAlternative, ProposedOperation,
};
pub use operation::{
    Alternative, CompensatingOperation, DecisionResolution, Disposition, MigrationPlan,
    MigrationRecord, OperationKind, OperationStatus, PendingDecision, RepointedUnit,
    ResolutionOutcome, SplitAssignment, TypeOperation, UnresolvedUnit,
};
pub use ports::{JudgePort, LedgerPort, LedgerRecordStream, ProjectStorePort};
pub use promotion::{
    Abstraction, DemotionEntry, DimensionResult, PromotionDecision, PromotionEntry,
    PromotionSubject, TestDimension, TestResult, TestVerdict, TransferCondition,
};
pub use provenance::{GenesisRecord, GenesisTarget, SourcePool};
pub use state::{ProjectSnapshot, SchemaRevision};
pub use taxonomy::{
    AGENT, CONCEPT, FieldKind, FieldOrigin, FieldSpec, MAX_EXTENDS_HOPS, TENSION, Tier,
    TypeDefinition, TypeStatus, UNIVERSAL_TYPE_IDS, is_universal_id,
};
pub use unit::{PipelineStage, TYPE_OVERRIDE_FIELD, Unit, UnitStatus};
