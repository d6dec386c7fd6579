//! Durable queue of pending decisions. The ledger is the source of truth;
//! this is its in-memory index, rebuilt by replay on open.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use taxon_protocol::{
    DecisionResolution, LedgerEntry, OperationId, PendingDecision, ProjectId, TaxonError,
    TaxonResult, TypeOperation,
};
use tokio::sync::RwLock;

#[derive(Debug, Default, Clone)]
pub struct DecisionQueue {
    pending: Arc<RwLock<IndexMap<OperationId, PendingDecision>>>,
    resolved: Arc<RwLock<HashMap<OperationId, PendingDecision>>>,
}

impl DecisionQueue {
    pub async fn open(&self, decision: PendingDecision) -> TaxonResult<()> {
        let id = decision.operation.id.clone();
        if self.resolved.read().await.contains_key(&id) {
            return Err(TaxonError::Consistency(format!(
                "decision for operation {id} was already resolved"
            )));
        }
        self.pending.write().await.insert(id, decision);
        Ok(())
    }

    /// Close a decision. Fails with `NotFound` if it is not open.
    pub async fn resolve(
        &self,
        operation_id: &OperationId,
        resolution: DecisionResolution,
    ) -> TaxonResult<PendingDecision> {
        let mut decision = self
            .pending
            .write()
            .await
            .shift_remove(operation_id)
            .ok_or_else(|| TaxonError::NotFound(format!("open decision {operation_id}")))?;
        decision.resolution = Some(resolution);
        self.resolved
            .write()
            .await
            .insert(operation_id.clone(), decision.clone());
        Ok(decision)
    }

    pub async fn get(&self, operation_id: &OperationId) -> Option<PendingDecision> {
        if let Some(open) = self.pending.read().await.get(operation_id) {
            return Some(open.clone());
        }
        self.resolved.read().await.get(operation_id).cloned()
    }

    pub async fn pending_for_project(&self, project_id: &ProjectId) -> Vec<PendingDecision> {
        self.pending
            .read()
            .await
            .values()
            .filter(|decision| decision.operation.project_id == *project_id)
            .cloned()
            .collect()
    }

    /// Open decisions in the same project whose operation overlaps `with`.
    pub async fn overlapping(&self, with: &TypeOperation) -> Vec<OperationId> {
        self.pending
            .read()
            .await
            .values()
            .filter(|decision| {
                decision.operation.project_id == with.project_id
                    && decision.operation.id != with.id
                    && decision.operation.overlaps(with)
            })
            .map(|decision| decision.operation.id.clone())
            .collect()
    }

    /// Fold one ledger entry into the index. Other entries are ignored.
    pub async fn replay(&self, entry: &LedgerEntry) {
        match entry {
            LedgerEntry::DecisionOpened { decision } => {
                self.pending
                    .write()
                    .await
                    .insert(decision.operation.id.clone(), decision.clone());
            }
            LedgerEntry::DecisionResolved {
                operation_id,
                resolution,
            } => {
                let _ = self.resolve(operation_id, resolution.clone()).await;
            }
            _ => {}
        }
    }
}
