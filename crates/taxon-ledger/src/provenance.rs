//! Append-only arena of genesis records, persisted through the ledger.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use taxon_protocol::{
    GenesisId, GenesisRecord, LedgerEntry, ProjectId, SourcePool, TaxonError, TaxonResult,
};
use tracing::{debug, info, instrument};

use crate::journal::LedgerJournal;

type Arena = IndexMap<GenesisId, GenesisRecord>;

#[derive(Clone)]
pub struct ProvenanceStore {
    journal: LedgerJournal,
    arenas: Arc<RwLock<HashMap<ProjectId, Arena>>>,
}

impl ProvenanceStore {
    pub fn new(journal: LedgerJournal) -> Self {
        Self {
            journal,
            arenas: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Shape and reference checks a record must pass before it is appended.
    pub fn check(&self, record: &GenesisRecord) -> TaxonResult<()> {
        let derived = record.source_pool == SourcePool::Derived;
        if derived == record.derived_from.is_empty() {
            return Err(TaxonError::Consistency(format!(
                "genesis {}: derived_from must be non-empty exactly when the pool is derived",
                record.id
            )));
        }
        let arenas = self.arenas.read();
        let arena = arenas.get(&record.project_id);
        if arena.is_some_and(|arena| arena.contains_key(&record.id)) {
            return Err(TaxonError::Consistency(format!(
                "genesis {} already recorded",
                record.id
            )));
        }
        for parent in &record.derived_from {
            if parent == &record.id {
                return Err(TaxonError::Consistency(format!(
                    "genesis {} derives from itself",
                    record.id
                )));
            }
            if !arena.is_some_and(|arena| arena.contains_key(parent)) {
                return Err(TaxonError::Consistency(format!(
                    "genesis {} derives from unknown record {parent}",
                    record.id
                )));
            }
        }
        Ok(())
    }

    /// Validate, append to the ledger, then index.
    #[instrument(skip(self, record), fields(project_id = %record.project_id, genesis_id = %record.id))]
    pub async fn record(&self, record: GenesisRecord) -> TaxonResult<GenesisRecord> {
        self.check(&record)?;
        self.journal
            .append_and_publish(
                &record.project_id,
                LedgerEntry::GenesisRecorded {
                    record: record.clone(),
                },
            )
            .await?;
        self.ingest(record.clone());
        debug!(pool = ?record.source_pool, "genesis recorded");
        Ok(record)
    }

    /// Index a record that is already in the ledger (replay).
    pub fn ingest(&self, record: GenesisRecord) {
        self.arenas
            .write()
            .entry(record.project_id.clone())
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn get(&self, project_id: &ProjectId, id: &GenesisId) -> Option<GenesisRecord> {
        self.arenas
            .read()
            .get(project_id)
            .and_then(|arena| arena.get(id))
            .cloned()
    }

    pub fn records(&self, project_id: &ProjectId) -> Vec<GenesisRecord> {
        self.arenas
            .read()
            .get(project_id)
            .map(|arena| arena.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Confirm a record. The original is never mutated; a derived record
    /// carrying `verified_by` is appended instead.
    pub async fn verify(
        &self,
        project_id: &ProjectId,
        id: &GenesisId,
        verifier: &str,
    ) -> TaxonResult<GenesisRecord> {
        let original = self
            .get(project_id, id)
            .ok_or_else(|| TaxonError::NotFound(format!("genesis {id}")))?;
        let mut confirmation = GenesisRecord::derived(
            project_id.clone(),
            original.target_type,
            original.target_id.clone(),
            vec![original.id.clone()],
        )
        .with_note(format!("verified by {verifier}"));
        confirmation.target_field = original.target_field.clone();
        confirmation.verified_by = Some(verifier.to_owned());
        let confirmation = self.record(confirmation).await?;
        info!(genesis_id = %id, verifier, "genesis verified");
        Ok(confirmation)
    }

    /// Whether a verification record points at `id`.
    pub fn is_verified(&self, project_id: &ProjectId, id: &GenesisId) -> bool {
        self.arenas.read().get(project_id).is_some_and(|arena| {
            arena
                .values()
                .any(|record| record.verified_by.is_some() && record.derived_from.contains(id))
        })
    }

    /// The record and all of its ancestors, breadth first.
    pub fn lineage(&self, project_id: &ProjectId, id: &GenesisId) -> TaxonResult<Vec<GenesisRecord>> {
        let arenas = self.arenas.read();
        let arena = arenas
            .get(project_id)
            .ok_or_else(|| TaxonError::NotFound(format!("project {project_id}")))?;
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let record = arena
                .get(&next)
                .ok_or_else(|| TaxonError::NotFound(format!("genesis {next}")))?;
            queue.extend(record.derived_from.iter().cloned());
            out.push(record.clone());
        }
        Ok(out)
    }

    /// Terminal ancestors of a record. Every one must be a seed or external
    /// evidence record.
    pub fn roots(&self, project_id: &ProjectId, id: &GenesisId) -> TaxonResult<Vec<GenesisRecord>> {
        let mut roots = Vec::new();
        for record in self.lineage(project_id, id)? {
            if !record.derived_from.is_empty() {
                continue;
            }
            if !record.source_pool.is_root() {
                return Err(TaxonError::Consistency(format!(
                    "genesis chain of {id} ends in non-root record {}",
                    record.id
                )));
            }
            roots.push(record);
        }
        Ok(roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::LedgerStreamHub;
    use crate::store::MemoryLedger;
    use taxon_protocol::{GenesisTarget, LedgerPort};

    fn store() -> (ProvenanceStore, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let journal = LedgerJournal::new(ledger.clone(), LedgerStreamHub::new(16));
        (ProvenanceStore::new(journal), ledger)
    }

    fn project() -> ProjectId {
        ProjectId::from_string("p")
    }

    #[tokio::test]
    async fn root_record_is_appended_to_ledger() {
        let (store, ledger) = store();
        let root = GenesisRecord::root(project(), GenesisTarget::Unit, "u1", SourcePool::Seed);
        store.record(root.clone()).await.unwrap();
        assert_eq!(ledger.head(&project()).await.unwrap(), 1);
        assert_eq!(store.get(&project(), &root.id), Some(root));
    }

    #[tokio::test]
    async fn derived_needs_existing_parents() {
        let (store, _) = store();
        let orphan = GenesisRecord::derived(
            project(),
            GenesisTarget::Field,
            "u1",
            vec![GenesisId::from_string("missing")],
        );
        assert!(matches!(
            store.record(orphan).await,
            Err(TaxonError::Consistency(_))
        ));
    }

    #[tokio::test]
    async fn pool_and_parents_must_agree() {
        let (store, _) = store();
        let mut root = GenesisRecord::root(project(), GenesisTarget::Unit, "u1", SourcePool::Seed);
        root.derived_from.push(GenesisId::from_string("x"));
        assert!(store.record(root).await.is_err());

        let mut derived = GenesisRecord::derived(project(), GenesisTarget::Unit, "u1", vec![]);
        derived.derived_from.clear();
        assert!(store.record(derived).await.is_err());
    }

    #[tokio::test]
    async fn chains_terminate_in_root_pools() {
        let (store, _) = store();
        let seed = store
            .record(GenesisRecord::root(project(), GenesisTarget::Unit, "u1", SourcePool::Seed))
            .await
            .unwrap();
        let evidence = store
            .record(GenesisRecord::root(
                project(),
                GenesisTarget::Unit,
                "u2",
                SourcePool::ExternalEvidence,
            ))
            .await
            .unwrap();
        let mid = store
            .record(GenesisRecord::derived(
                project(),
                GenesisTarget::Field,
                "u3",
                vec![seed.id.clone()],
            ))
            .await
            .unwrap();
        let leaf = store
            .record(GenesisRecord::derived(
                project(),
                GenesisTarget::Unit,
                "u3",
                vec![mid.id.clone(), evidence.id.clone()],
            ))
            .await
            .unwrap();

        let lineage = store.lineage(&project(), &leaf.id).unwrap();
        assert_eq!(lineage.len(), 4);
        let roots = store.roots(&project(), &leaf.id).unwrap();
        assert_eq!(roots.len(), 2);
        assert!(roots.iter().all(|r| r.source_pool.is_root()));
    }

    #[tokio::test]
    async fn verification_appends_instead_of_mutating() {
        let (store, ledger) = store();
        let evidence = store
            .record(GenesisRecord::root(
                project(),
                GenesisTarget::Unit,
                "u1",
                SourcePool::ExternalEvidence,
            ))
            .await
            .unwrap();
        assert!(!store.is_verified(&project(), &evidence.id));

        let confirmation = store.verify(&project(), &evidence.id, "reviewer").await.unwrap();
        assert_eq!(confirmation.derived_from, vec![evidence.id.clone()]);
        assert!(store.is_verified(&project(), &evidence.id));
        assert_eq!(store.get(&project(), &evidence.id), Some(evidence));
        assert_eq!(ledger.head(&project()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn projects_do_not_share_arenas() {
        let (store, _) = store();
        let seed = store
            .record(GenesisRecord::root(project(), GenesisTarget::Unit, "u1", SourcePool::Seed))
            .await
            .unwrap();
        let foreign = GenesisRecord::derived(
            ProjectId::from_string("other"),
            GenesisTarget::Unit,
            "u9",
            vec![seed.id],
        );
        assert!(store.record(foreign).await.is_err());
    }
}
