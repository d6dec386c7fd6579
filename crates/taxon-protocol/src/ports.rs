//! Runtime ports for taxon integrations.
//!
//! These traits are the only boundary between the engine and external
//! implementations: the judgment oracle, the project state store and the
//! append-only ledger.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Streaming uses boxed trait objects (`LedgerRecordStream`).

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::TaxonResult;
use crate::event::LedgerRecord;
use crate::ids::{ProjectId, SeqNo, SnapshotRef};
use crate::judge::{JudgeReply, JudgeRequest};
use crate::state::ProjectSnapshot;

pub type LedgerRecordStream = BoxStream<'static, TaxonResult<LedgerRecord>>;

/// Qualitative assessments. Implementations report transport failures as
/// `OracleUnavailable`; shape checks happen in the caller.
#[async_trait]
pub trait JudgePort: Send + Sync {
    async fn judge(&self, request: JudgeRequest) -> TaxonResult<JudgeReply>;
}

#[async_trait]
pub trait ProjectStorePort: Send + Sync {
    async fn load(&self, project_id: &ProjectId) -> TaxonResult<Option<ProjectSnapshot>>;

    /// Replace the project's state if its stored version equals
    /// `expected_version` (`None` when the project does not exist yet).
    /// Fails with `MigrationConflict` otherwise and changes nothing.
    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        snapshot: ProjectSnapshot,
    ) -> TaxonResult<()>;

    /// Store a content-addressed copy of a snapshot.
    async fn put_blob(&self, snapshot: &ProjectSnapshot) -> TaxonResult<SnapshotRef>;

    async fn get_blob(&self, snapshot_ref: &SnapshotRef) -> TaxonResult<Option<ProjectSnapshot>>;

    async fn list_projects(&self) -> TaxonResult<Vec<ProjectId>>;
}

#[async_trait]
pub trait LedgerPort: Send + Sync {
    /// Append one record. Its sequence must be exactly `head + 1`.
    async fn append(&self, record: LedgerRecord) -> TaxonResult<LedgerRecord>;
    async fn read(
        &self,
        project_id: &ProjectId,
        from_sequence: SeqNo,
        limit: usize,
    ) -> TaxonResult<Vec<LedgerRecord>>;
    async fn head(&self, project_id: &ProjectId) -> TaxonResult<SeqNo>;
}
