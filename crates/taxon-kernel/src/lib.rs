//! # taxon-kernel: the engine behind one facade
//!
//! [`KernelBuilder`] wires the ledger, the project store, the oracle and the
//! runtime components; [`TaxonKernel`] exposes projects, detection cycles,
//! pending decisions and the generative pipeline.
//!
//! Within a project every writer holds the project gate, so detection cycles,
//! applications and pipeline commits are serialized. Oracle calls outside a
//! cycle run before the gate is taken. Projects are independent.

mod cycle;
mod decisions;
mod generative;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taxon_judge::OfflineJudge;
use taxon_ledger::{FileLedger, LedgerJournal, LedgerStreamHub, MemoryLedger, ProvenanceStore};
use taxon_policy::{DecisionQueue, OperationRouter};
use taxon_protocol::{
    Abstraction, FrictionEvent, FrictionId, FrictionStatus, GenesisId, GenesisRecord,
    GenesisTarget, JudgePort, LedgerEntry, LedgerPort, LedgerRecord, LedgerRecordStream,
    MigrationId, ProjectId, ProjectStorePort, SourcePool, TaxonError, TestResult, TypeDefId,
    TypeDefinition, TypeOperation, TypeStatus, Unit, UnitId,
};
use taxon_registry::{DoctrineBase, ProjectState};
use taxon_runtime::{
    Diagnoser, EvidenceAggregator, FrictionDetector, GenerativePipeline, MigrationExecutor,
    PromotionEvaluator, PromotionLedger, RuntimeConfig,
};
use taxon_store::{FileProjectStore, MemoryProjectStore};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

pub use cycle::CycleReport;

const MAX_PROJECT_ID_LEN: usize = 64;

#[derive(Clone)]
pub struct KernelBuilder {
    config: RuntimeConfig,
    judge: Arc<dyn JudgePort>,
    doctrine: Option<Arc<DoctrineBase>>,
    in_memory: bool,
}

impl KernelBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            config: RuntimeConfig::new(root),
            judge: Arc::new(OfflineJudge),
            doctrine: None,
            in_memory: false,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn judge(mut self, judge: Arc<dyn JudgePort>) -> Self {
        self.judge = judge;
        self
    }

    /// Share a doctrine base with other kernels.
    pub fn doctrine(mut self, doctrine: Arc<DoctrineBase>) -> Self {
        self.doctrine = Some(doctrine);
        self
    }

    /// Keep the ledger and project state in memory instead of under `root`.
    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn build(self) -> TaxonKernel {
        let root = self.config.root.clone();
        let (ledger, store): (Arc<dyn LedgerPort>, Arc<dyn ProjectStorePort>) = if self.in_memory
        {
            (
                Arc::new(MemoryLedger::new()),
                Arc::new(MemoryProjectStore::new()),
            )
        } else {
            (
                Arc::new(FileLedger::new(root.join("ledger"))),
                Arc::new(FileProjectStore::new(root.join("projects"))),
            )
        };
        let journal = LedgerJournal::new(ledger, LedgerStreamHub::new(self.config.stream_buffer));
        let doctrine = self
            .doctrine
            .unwrap_or_else(|| Arc::new(DoctrineBase::with_universal_seed()));

        TaxonKernel {
            doctrine,
            provenance: ProvenanceStore::new(journal.clone()),
            journal,
            evidence: EvidenceAggregator::new(self.config.evidence.clone()),
            detector: FrictionDetector::new(self.judge.clone()),
            diagnoser: Diagnoser::new(self.judge.clone()),
            router: OperationRouter::new(self.config.routing.clone()),
            executor: MigrationExecutor::new(store.clone()),
            pipeline: GenerativePipeline::new(self.judge.clone()),
            evaluator: PromotionEvaluator::new(self.judge),
            promotions: Arc::new(PromotionLedger::new()),
            decisions: DecisionQueue::default(),
            store,
            projects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build and replay every persisted project ledger.
    pub async fn open(self) -> Result<TaxonKernel> {
        let kernel = self.build();
        kernel.restore().await?;
        Ok(kernel)
    }
}

/// Request to add a unit written by hand or imported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDraft {
    /// Type id, display name or earlier alias.
    pub type_name: String,
    pub domain: String,
    #[serde(default)]
    pub fields: IndexMap<String, Value>,
    #[serde(default = "seed_pool")]
    pub source_pool: SourcePool,
    #[serde(default)]
    pub derived_from: Vec<GenesisId>,
    #[serde(default)]
    pub note: String,
}

fn seed_pool() -> SourcePool {
    SourcePool::Seed
}

impl UnitDraft {
    pub fn new(type_name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            domain: domain.into(),
            fields: IndexMap::new(),
            source_pool: SourcePool::Seed,
            derived_from: Vec::new(),
            note: String::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn from_evidence(mut self, note: impl Into<String>) -> Self {
        self.source_pool = SourcePool::ExternalEvidence;
        self.note = note.into();
        self
    }

    pub fn derived_from(mut self, parents: Vec<GenesisId>) -> Self {
        self.source_pool = SourcePool::Derived;
        self.derived_from = parents;
        self
    }
}

/// Per-project indexes rebuilt from the ledger.
#[derive(Debug, Default)]
struct ProjectIndex {
    frictions: IndexMap<FrictionId, FrictionEvent>,
    tests: HashMap<UnitId, TestResult>,
    abstractions: HashMap<UnitId, Abstraction>,
    suggestions: Vec<TypeOperation>,
    /// Applied operations by the migration that carried them out.
    operations: HashMap<MigrationId, TypeOperation>,
}

impl ProjectIndex {
    fn ingest(&mut self, entry: &LedgerEntry) {
        match entry {
            LedgerEntry::FrictionDetected { event } => {
                self.frictions.insert(event.id.clone(), event.clone());
            }
            LedgerEntry::FrictionStatusChanged {
                friction_id,
                status,
            } => {
                if let Some(event) = self.frictions.get_mut(friction_id) {
                    event.status = *status;
                }
            }
            LedgerEntry::TestRecorded { result } => {
                self.tests.insert(result.unit_id.clone(), result.clone());
            }
            LedgerEntry::AbstractionRecorded { abstraction } => {
                self.abstractions
                    .insert(abstraction.unit_id.clone(), abstraction.clone());
            }
            LedgerEntry::SuggestionRecorded { operation } => {
                self.suggestions.push(operation.clone());
            }
            LedgerEntry::MigrationApplied { record, operation } => {
                self.operations.insert(record.id.clone(), operation.clone());
            }
            LedgerEntry::MigrationAborted { migration_id, .. } => {
                self.operations.remove(migration_id);
            }
            _ => {}
        }
    }
}

/// A validated next state that is not committed yet.
struct Staged<T> {
    base: u64,
    state: ProjectState,
    out: T,
}

struct ProjectSlot {
    /// Held by every writer of this project.
    gate: tokio::sync::Mutex<()>,
    state: tokio::sync::RwLock<ProjectState>,
    index: RwLock<ProjectIndex>,
}

impl ProjectSlot {
    fn new(state: ProjectState) -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            state: tokio::sync::RwLock::new(state),
            index: RwLock::new(ProjectIndex::default()),
        }
    }
}

#[derive(Clone)]
pub struct TaxonKernel {
    doctrine: Arc<DoctrineBase>,
    store: Arc<dyn ProjectStorePort>,
    journal: LedgerJournal,
    provenance: ProvenanceStore,
    evidence: EvidenceAggregator,
    detector: FrictionDetector,
    diagnoser: Diagnoser,
    router: OperationRouter,
    executor: MigrationExecutor,
    pipeline: GenerativePipeline,
    evaluator: PromotionEvaluator,
    promotions: Arc<PromotionLedger>,
    decisions: DecisionQueue,
    projects: Arc<Mutex<HashMap<ProjectId, Arc<ProjectSlot>>>>,
}

fn validate_project_id(raw: &str) -> Result<ProjectId, TaxonError> {
    let valid = !raw.is_empty()
        && raw.len() <= MAX_PROJECT_ID_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !valid {
        return Err(TaxonError::Validation(format!(
            "project id {raw:?} must be 1-{MAX_PROJECT_ID_LEN} characters of a-z, 0-9, '-' or '_'"
        )));
    }
    Ok(ProjectId::from_string(raw))
}

impl TaxonKernel {
    pub fn doctrine(&self) -> &Arc<DoctrineBase> {
        &self.doctrine
    }

    pub fn promotions(&self) -> &PromotionLedger {
        &self.promotions
    }

    fn slot(&self, project_id: &ProjectId) -> Result<Arc<ProjectSlot>, TaxonError> {
        self.projects
            .lock()
            .get(project_id)
            .cloned()
            .ok_or_else(|| TaxonError::NotFound(format!("project {project_id}")))
    }

    /// Append to the project ledger and fold the entry into the project's
    /// indexes.
    async fn append(
        &self,
        slot: &ProjectSlot,
        project_id: &ProjectId,
        entry: LedgerEntry,
    ) -> Result<LedgerRecord> {
        let record = self
            .journal
            .append_and_publish(project_id, entry)
            .await
            .context("failed appending ledger entry")?;
        slot.index.write().ingest(&record.kind);
        Ok(record)
    }

    async fn set_friction_status(
        &self,
        slot: &ProjectSlot,
        project_id: &ProjectId,
        friction_id: &FrictionId,
        status: FrictionStatus,
    ) -> Result<()> {
        self.append(
            slot,
            project_id,
            LedgerEntry::FrictionStatusChanged {
                friction_id: friction_id.clone(),
                status,
            },
        )
        .await?;
        Ok(())
    }

    /// Run `change` on a working copy, validate it and commit it as the
    /// next version. The caller holds the gate.
    async fn mutate<T>(
        &self,
        slot: &ProjectSlot,
        change: impl FnOnce(&mut ProjectState) -> Result<T, TaxonError>,
    ) -> Result<T> {
        let staged = self.stage(slot, change).await?;
        self.commit_staged(slot, staged.base, staged.state).await?;
        Ok(staged.out)
    }

    /// Run `change` on a working copy and validate it as the next version
    /// without committing. The caller holds the gate.
    async fn stage<T>(
        &self,
        slot: &ProjectSlot,
        change: impl FnOnce(&mut ProjectState) -> Result<T, TaxonError>,
    ) -> Result<Staged<T>> {
        let mut state = slot.state.read().await.clone();
        let base = state.version;
        let out = change(&mut state)?;
        state.advance();
        state.validate()?;
        Ok(Staged { base, state, out })
    }

    async fn commit_staged(&self, slot: &ProjectSlot, base: u64, state: ProjectState) -> Result<()> {
        self.store
            .compare_and_swap(Some(base), state.to_snapshot())
            .await?;
        *slot.state.write().await = state;
        Ok(())
    }

    /// Finish migrations whose record reached the ledger but whose state
    /// swap did not. A record the stored state can no longer take is marked
    /// aborted.
    async fn finish_logged(
        &self,
        slot: &ProjectSlot,
        project_id: &ProjectId,
        records: &[LedgerRecord],
    ) -> Result<()> {
        let aborted: HashSet<&MigrationId> = records
            .iter()
            .filter_map(|entry| match &entry.kind {
                LedgerEntry::MigrationAborted { migration_id, .. } => Some(migration_id),
                _ => None,
            })
            .collect();
        for entry in records {
            let (LedgerEntry::MigrationApplied { record, .. }
            | LedgerEntry::MigrationReverted { record }) = &entry.kind
            else {
                continue;
            };
            let version = slot.state.read().await.version;
            if aborted.contains(&record.id) || record.version_after <= version {
                continue;
            }
            let snapshot = if record.version_before == version {
                self.store.get_blob(&record.after_snapshot_ref).await?
            } else {
                None
            };
            match snapshot {
                Some(snapshot) => {
                    self.store
                        .compare_and_swap(Some(version), snapshot.clone())
                        .await?;
                    *slot.state.write().await = ProjectState::from_snapshot(snapshot, &self.doctrine);
                    info!(migration_id = %record.id, version = record.version_after, "logged migration finished");
                }
                None => {
                    warn!(migration_id = %record.id, version, "logged migration cannot be finished");
                    let aborted = self
                        .append(
                            slot,
                            project_id,
                            LedgerEntry::MigrationAborted {
                                migration_id: record.id.clone(),
                                reason: format!(
                                    "stored state is at version {version}, record expects {}",
                                    record.version_before
                                ),
                            },
                        )
                        .await?;
                    self.executor.ingest(&aborted.kind);
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn create_project(&self, project_id: &str) -> Result<ProjectId> {
        let project_id = validate_project_id(project_id)?;
        if self.projects.lock().contains_key(&project_id) {
            return Err(TaxonError::Consistency(format!(
                "project {project_id} already exists"
            ))
            .into());
        }
        let state = ProjectState::new(project_id.clone(), &self.doctrine);
        let doctrine_types = state.registry.inherited_ids().len();
        self.store
            .compare_and_swap(None, state.to_snapshot())
            .await
            .with_context(|| format!("failed creating project {project_id}"))?;
        let slot = Arc::new(ProjectSlot::new(state));
        self.projects
            .lock()
            .insert(project_id.clone(), slot.clone());
        self.append(
            &slot,
            &project_id,
            LedgerEntry::ProjectCreated { doctrine_types },
        )
        .await?;
        info!(%project_id, doctrine_types, "project created");
        Ok(project_id)
    }

    pub fn list_projects(&self) -> Vec<ProjectId> {
        let mut ids: Vec<_> = self.projects.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current state of a project.
    pub async fn state(&self, project_id: &ProjectId) -> Result<ProjectState> {
        let slot = self.slot(project_id)?;
        let state = slot.state.read().await.clone();
        Ok(state)
    }

    /// Live types of a project.
    pub async fn list_types(&self, project_id: &ProjectId) -> Result<Vec<TypeDefinition>> {
        let slot = self.slot(project_id)?;
        let state = slot.state.read().await;
        Ok(state
            .registry
            .live_definitions()
            .into_iter()
            .cloned()
            .collect())
    }

    /// Add a unit under an active type, with its genesis record.
    #[instrument(skip(self, draft), fields(%project_id, type_name = %draft.type_name))]
    pub async fn add_unit(&self, project_id: &ProjectId, draft: UnitDraft) -> Result<Unit> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;

        let type_id = {
            let state = slot.state.read().await;
            let definition = state
                .registry
                .get(&TypeDefId::from_string(draft.type_name.trim()))
                .or_else(|| state.registry.resolve_name(&draft.type_name))
                .ok_or_else(|| TaxonError::NotFound(format!("type {}", draft.type_name)))?;
            if definition.status != TypeStatus::Active {
                return Err(TaxonError::Consistency(format!(
                    "type {} is {:?} and takes no new units",
                    definition.id, definition.status
                ))
                .into());
            }
            definition.id.clone()
        };

        let mut unit = Unit::new(
            project_id.clone(),
            type_id,
            0,
            draft.domain.trim(),
            GenesisId::default(),
        );
        unit.display_fields = draft.fields;
        let genesis = if draft.derived_from.is_empty() {
            GenesisRecord::root(
                project_id.clone(),
                GenesisTarget::Unit,
                unit.id.as_str(),
                draft.source_pool,
            )
        } else {
            GenesisRecord::derived(
                project_id.clone(),
                GenesisTarget::Unit,
                unit.id.as_str(),
                draft.derived_from,
            )
        }
        .with_note(draft.note);
        self.provenance.check(&genesis)?;
        unit.genesis_id = genesis.id.clone();

        let staged = self
            .stage(&slot, |state| {
                state.units.insert(unit.clone(), &state.registry)?;
                state.units.require(&unit.id).cloned()
            })
            .await?;
        let unit = staged.out;
        self.provenance
            .record(genesis)
            .await
            .context("failed recording genesis")?;
        self.append(
            &slot,
            project_id,
            LedgerEntry::UnitRecorded {
                unit_id: unit.id.clone(),
                type_id: unit.type_id.clone(),
                version: unit.version,
            },
        )
        .await?;
        self.commit_staged(&slot, staged.base, staged.state).await?;
        debug!(unit_id = %unit.id, "unit added");
        Ok(unit)
    }

    /// Read a unit upgraded to its type's current schema.
    pub async fn get_unit(&self, project_id: &ProjectId, unit_id: &UnitId) -> Result<Unit> {
        let slot = self.slot(project_id)?;
        let state = slot.state.read().await;
        Ok(state.units.get_upgraded(unit_id, &state.registry)?)
    }

    /// Set or clear the free-text type a user wrote instead of picking one.
    pub async fn set_type_override(
        &self,
        project_id: &ProjectId,
        unit_id: &UnitId,
        text: Option<&str>,
    ) -> Result<()> {
        let slot = self.slot(project_id)?;
        let _gate = slot.gate.lock().await;
        self.mutate(&slot, |state| state.units.set_type_override(unit_id, text))
            .await
    }

    pub fn frictions(&self, project_id: &ProjectId) -> Result<Vec<FrictionEvent>> {
        let slot = self.slot(project_id)?;
        let frictions = slot.index.read().frictions.values().cloned().collect();
        Ok(frictions)
    }

    pub fn suggestions(&self, project_id: &ProjectId) -> Result<Vec<TypeOperation>> {
        let slot = self.slot(project_id)?;
        let suggestions = slot.index.read().suggestions.clone();
        Ok(suggestions)
    }

    pub fn lineage(&self, project_id: &ProjectId, id: &GenesisId) -> Result<Vec<GenesisRecord>> {
        Ok(self.provenance.lineage(project_id, id)?)
    }

    pub async fn verify_genesis(
        &self,
        project_id: &ProjectId,
        id: &GenesisId,
        verifier: &str,
    ) -> Result<GenesisRecord> {
        Ok(self.provenance.verify(project_id, id, verifier).await?)
    }

    pub async fn ledger(&self, project_id: &ProjectId) -> Result<Vec<LedgerRecord>> {
        self.journal
            .replay(project_id)
            .await
            .with_context(|| format!("failed reading ledger of {project_id}"))
    }

    pub fn subscribe(&self, project_id: ProjectId) -> LedgerRecordStream {
        self.journal.subscribe_project(project_id)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<LedgerRecord> {
        self.journal.subscribe()
    }

    /// Rebuild doctrine, the promotion ledger, pending decisions, migration
    /// records and provenance from the persisted ledgers, then finish any
    /// migration logged without its state swap. Returns the number of
    /// projects restored.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize> {
        let project_ids = self
            .store
            .list_projects()
            .await
            .context("failed listing projects")?;
        let mut ledgers = Vec::with_capacity(project_ids.len());
        for project_id in project_ids {
            if self.projects.lock().contains_key(&project_id) {
                continue;
            }
            let records = self
                .journal
                .replay(&project_id)
                .await
                .with_context(|| format!("failed replaying ledger of {project_id}"))?;
            ledgers.push((project_id, records));
        }

        // Doctrine and promotions span projects; fold them in time order
        // before any snapshot, since snapshots reference inherited types.
        let mut shared: Vec<&LedgerRecord> = ledgers
            .iter()
            .flat_map(|(_, records)| records.iter())
            .filter(|record| {
                matches!(
                    record.kind,
                    LedgerEntry::DoctrinePublished { .. }
                        | LedgerEntry::DoctrineRetracted { .. }
                        | LedgerEntry::Promoted { .. }
                        | LedgerEntry::Demoted { .. }
                )
            })
            .collect();
        shared.sort_by_key(|record| record.recorded_at);
        for record in shared {
            match &record.kind {
                LedgerEntry::DoctrinePublished { definition } => {
                    if let Err(error) = self.doctrine.publish(definition.clone()) {
                        warn!(type_id = %definition.id, %error, "doctrine entry not replayed");
                    }
                }
                LedgerEntry::DoctrineRetracted { type_id } => {
                    if let Err(error) = self.doctrine.retract(type_id) {
                        warn!(%type_id, %error, "doctrine retraction not replayed");
                    }
                }
                other => self.promotions.ingest(other),
            }
        }

        let mut restored = 0;
        for (project_id, records) in ledgers {
            let Some(snapshot) = self
                .store
                .load(&project_id)
                .await
                .with_context(|| format!("failed loading project {project_id}"))?
            else {
                warn!(%project_id, "ledger without project state, skipping");
                continue;
            };
            let state = ProjectState::from_snapshot(snapshot, &self.doctrine);
            let slot = ProjectSlot::new(state);
            for record in &records {
                slot.index.write().ingest(&record.kind);
                self.decisions.replay(&record.kind).await;
                self.executor.ingest(&record.kind);
                if let LedgerEntry::GenesisRecorded { record } = &record.kind {
                    self.provenance.ingest(record.clone());
                }
            }
            self.finish_logged(&slot, &project_id, &records)
                .await
                .with_context(|| format!("failed finishing logged migrations of {project_id}"))?;
            debug!(%project_id, records = records.len(), "project restored");
            self.projects.lock().insert(project_id, Arc::new(slot));
            restored += 1;
        }
        info!(projects = restored, "kernel restored from ledger");
        Ok(restored)
    }
}
