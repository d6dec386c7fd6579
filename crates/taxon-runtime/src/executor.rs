//! Transactional application of type operations.
//!
//! Every operation runs against a clone of the project state. The clone is
//! validated as a whole and both snapshots are stored as content-addressed
//! blobs; that is the prepare step, and it leaves the project untouched.
//! The caller makes the resulting record durable, then [`MigrationExecutor::commit`]
//! swaps the new state in with compare-and-swap on the project version. A
//! record whose swap never happened can be finished from its after-blob.
//!
//! The undo of an operation is the diff between the state before and after
//! it: before-images of every changed definition and unit row, plus the ids
//! of types the operation created.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use taxon_protocol::{
    CompensatingOperation, LedgerEntry, MigrationId, MigrationPlan, MigrationRecord,
    OperationId, OperationStatus, ProjectStorePort, RepointedUnit, SnapshotRef, SplitAssignment,
    TaxonError, TaxonResult, Tier, TypeDefId, TypeDefinition, TypeOperation, TypeStatus, UnitId,
    UnresolvedUnit, is_universal_id,
};
use taxon_registry::ProjectState;
use tracing::{debug, info, instrument, warn};

/// Unit-level effects of one transform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    pub repointed: Vec<RepointedUnit>,
    pub unresolved: Vec<UnresolvedUnit>,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub record: MigrationRecord,
    pub operation: TypeOperation,
    pub state: ProjectState,
    /// The operation already had a record; nothing was executed.
    pub replayed: bool,
}

fn live_definition(state: &ProjectState, id: &TypeDefId) -> TaxonResult<TypeDefinition> {
    let definition = state.registry.require(id)?;
    if !definition.status.is_live() {
        return Err(TaxonError::Consistency(format!(
            "type {id} is {:?}",
            definition.status
        )));
    }
    Ok(definition.clone())
}

fn units_of(state: &ProjectState, id: &TypeDefId) -> Vec<UnitId> {
    state
        .units
        .by_type(id)
        .into_iter()
        .map(|unit| unit.id.clone())
        .collect()
}

/// Apply `operation` to `state` in place, stamping changed definitions with
/// `at`. Callers run this on a working copy.
pub fn transform(
    operation: &TypeOperation,
    state: &mut ProjectState,
    at: u64,
) -> TaxonResult<Effects> {
    if operation.kind != operation.migration_plan.kind() {
        return Err(TaxonError::Consistency(format!(
            "operation {} is a {} but carries a {} plan",
            operation.id,
            operation.kind.as_str(),
            operation.migration_plan.kind().as_str()
        )));
    }
    if operation.kind.forbidden_on_universal()
        && let Some(universal) = operation
            .touched_type_ids()
            .into_iter()
            .find(is_universal_id)
    {
        return Err(TaxonError::Consistency(format!(
            "universal type {universal} cannot be the subject of a {} operation",
            operation.kind.as_str()
        )));
    }
    if !operation.lists_match_plan() {
        return Err(TaxonError::Consistency(format!(
            "operation {} lists types {:?} -> {:?} but its plan touches {:?}",
            operation.id,
            operation.source_type_ids,
            operation.target_type_ids,
            operation.migration_plan.type_ids()
        )));
    }

    let mut effects = Effects::default();
    match &operation.migration_plan {
        MigrationPlan::Rename { type_id, new_alias } => {
            let alias = new_alias.trim();
            if alias.is_empty() {
                return Err(TaxonError::Validation("empty alias".to_owned()));
            }
            if let Some(other) = state.registry.resolve_name(alias)
                && &other.id != type_id
            {
                return Err(TaxonError::Consistency(format!(
                    "\"{alias}\" already names type {}",
                    other.id
                )));
            }
            let mut definition = state.registry.require(type_id)?.clone();
            if definition.display_name() == alias {
                return Err(TaxonError::Consistency(format!(
                    "type {type_id} is already displayed as \"{alias}\""
                )));
            }
            definition.aliases.retain(|existing| existing != alias);
            definition.aliases.push(alias.to_owned());
            state.registry.put(definition, at)?;
        }
        MigrationPlan::Hide { type_id } => {
            let mut definition = live_definition(state, type_id)?;
            if definition.status != TypeStatus::Active {
                return Err(TaxonError::Consistency(format!(
                    "type {type_id} is already hidden"
                )));
            }
            definition.status = TypeStatus::Hidden;
            state.registry.put(definition, at)?;
        }
        MigrationPlan::Merge { sources, survivor } => {
            if sources.is_empty() || sources.contains(survivor) {
                return Err(TaxonError::Consistency(format!(
                    "merge into {survivor} needs distinct sources"
                )));
            }
            let mut merged = live_definition(state, survivor)?;
            let mut added = 0_usize;
            for source in sources {
                let definition = live_definition(state, source)?;
                for field in definition.schema.iter().filter(|field| !field.inert) {
                    match merged.schema.iter_mut().find(|f| f.name == field.name) {
                        Some(existing) => {
                            if !existing.contributed_by.contains(source) {
                                existing.contributed_by.push(source.clone());
                            }
                        }
                        None => {
                            merged.schema.push(field.clone());
                            added += 1;
                        }
                    }
                }
                if merged.extends.as_ref() == Some(source) {
                    merged.extends = definition.extends.clone();
                }
            }
            if merged.frozen && added > 0 {
                return Err(TaxonError::Consistency(format!(
                    "survivor {survivor} has a frozen schema and cannot take {added} new fields"
                )));
            }
            state.registry.put(merged, at)?;

            for source in sources {
                for unit_id in units_of(state, source) {
                    let moved = state.units.repoint(&unit_id, survivor, &state.registry)?;
                    effects.repointed.push(moved);
                }
                for child in state.registry.children_of(source) {
                    if &child == survivor || sources.contains(&child) {
                        continue;
                    }
                    let mut definition = state.registry.require(&child)?.clone();
                    definition.extends = Some(survivor.clone());
                    state.registry.put(definition, at)?;
                }
            }
            for source in sources {
                let mut definition = state.registry.require(source)?.clone();
                definition.status = TypeStatus::MergedInto {
                    target: survivor.clone(),
                };
                state.registry.put(definition, at)?;
            }
        }
        MigrationPlan::Split {
            source,
            targets,
            assignments,
        } => {
            let mut original = live_definition(state, source)?;
            for target in targets {
                if state.registry.contains(&target.id) {
                    return Err(TaxonError::Consistency(format!(
                        "split target {} already exists",
                        target.id
                    )));
                }
                if target.tier == Tier::Universal {
                    return Err(TaxonError::Consistency(format!(
                        "split target {} cannot be universal",
                        target.id
                    )));
                }
                let mut definition = target.clone();
                definition.status = TypeStatus::Active;
                state.registry.put(definition, at)?;
            }
            for unit_id in units_of(state, source) {
                let reason = match assignments.get(&unit_id) {
                    Some(SplitAssignment::Resolved { target })
                        if targets.iter().any(|t| &t.id == target) =>
                    {
                        let moved = state.units.repoint(&unit_id, target, &state.registry)?;
                        effects.repointed.push(moved);
                        continue;
                    }
                    Some(SplitAssignment::Resolved { target }) => {
                        format!("target {target} is not part of this split")
                    }
                    Some(SplitAssignment::Unresolved { reason }) => reason.clone(),
                    None => "unit was added after the split was planned".to_owned(),
                };
                effects.unresolved.push(UnresolvedUnit {
                    unit_id,
                    left_on: source.clone(),
                    reason,
                });
            }
            if original.status == TypeStatus::Active {
                original.status = TypeStatus::Hidden;
                state.registry.put(original, at)?;
            }
        }
        MigrationPlan::Promote { type_id } => {
            let mut definition = live_definition(state, type_id)?;
            if definition.tier != Tier::Emergent {
                return Err(TaxonError::Consistency(format!(
                    "only emergent types can be promoted, {type_id} is {:?}",
                    definition.tier
                )));
            }
            definition.tier = Tier::Domain;
            definition.frozen = true;
            for field in definition.schema.iter_mut().filter(|field| field.tracking) {
                field.inert = true;
            }
            state.registry.put(definition, at)?;
        }
        MigrationPlan::Demote { type_id } => {
            let mut definition = live_definition(state, type_id)?;
            if definition.tier != Tier::Domain {
                return Err(TaxonError::Consistency(format!(
                    "only domain types can be demoted, {type_id} is {:?}",
                    definition.tier
                )));
            }
            definition.tier = Tier::Emergent;
            definition.frozen = false;
            state.registry.put(definition, at)?;
        }
        MigrationPlan::Create { definition } => {
            if state.registry.contains(&definition.id) {
                return Err(TaxonError::Consistency(format!(
                    "type {} already exists",
                    definition.id
                )));
            }
            if definition.tier == Tier::Universal {
                return Err(TaxonError::Consistency(
                    "universal types cannot be created".to_owned(),
                ));
            }
            let mut definition = definition.clone();
            definition.status = TypeStatus::Active;
            state.registry.put(definition, at)?;
        }
    }
    Ok(effects)
}

/// Undo contents: before-images of what changed between `before` and `after`.
fn diff_compensation(
    operation_id: &OperationId,
    before: &ProjectState,
    after: &ProjectState,
) -> CompensatingOperation {
    let mut restore_types = Vec::new();
    let mut remove_types = Vec::new();
    for definition in after.registry.definitions() {
        match before.registry.get(&definition.id) {
            Some(prior) if prior != definition => restore_types.push(prior.clone()),
            Some(_) => {}
            None => remove_types.push(definition.id.clone()),
        }
    }
    let mut restore_units = Vec::new();
    let mut expected_unit_versions = BTreeMap::new();
    for unit in after.units.all() {
        if let Some(prior) = before.units.get(&unit.id)
            && prior != unit
        {
            restore_units.push(prior.clone());
            expected_unit_versions.insert(unit.id.clone(), unit.version);
        }
    }
    CompensatingOperation {
        id: OperationId::default(),
        reverses: operation_id.clone(),
        restore_types,
        remove_types,
        restore_units,
        expected_unit_versions,
    }
}

fn same_undo(a: &CompensatingOperation, b: &CompensatingOperation) -> bool {
    a.reverses == b.reverses
        && a.restore_types == b.restore_types
        && a.remove_types == b.remove_types
        && a.restore_units == b.restore_units
        && a.expected_unit_versions == b.expected_unit_versions
}

#[derive(Clone)]
pub struct MigrationExecutor {
    store: Arc<dyn ProjectStorePort>,
    applied: Arc<RwLock<HashMap<OperationId, MigrationRecord>>>,
    reverted: Arc<RwLock<HashSet<MigrationId>>>,
}

impl MigrationExecutor {
    pub fn new(store: Arc<dyn ProjectStorePort>) -> Self {
        Self {
            store,
            applied: Arc::new(RwLock::new(HashMap::new())),
            reverted: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Fold a ledger entry into the applied/reverted index.
    pub fn ingest(&self, entry: &LedgerEntry) {
        match entry {
            LedgerEntry::MigrationApplied { record, .. } => {
                self.applied
                    .write()
                    .insert(record.operation_id.clone(), record.clone());
            }
            LedgerEntry::MigrationReverted { record } => self.index(record),
            LedgerEntry::MigrationAborted { migration_id, .. } => {
                let removed = {
                    let mut applied = self.applied.write();
                    let key = applied
                        .iter()
                        .find(|(_, record)| &record.id == migration_id)
                        .map(|(key, _)| key.clone());
                    key.and_then(|key| applied.remove(&key))
                };
                if let Some(original) = removed.and_then(|record| record.reverses) {
                    self.reverted.write().remove(&original);
                }
            }
            _ => {}
        }
    }

    fn index(&self, record: &MigrationRecord) {
        if let Some(original) = &record.reverses {
            self.reverted.write().insert(original.clone());
        }
        self.applied
            .write()
            .insert(record.operation_id.clone(), record.clone());
    }

    pub fn record_for(&self, operation_id: &OperationId) -> Option<MigrationRecord> {
        self.applied.read().get(operation_id).cloned()
    }

    pub fn find(&self, migration_id: &MigrationId) -> Option<MigrationRecord> {
        self.applied
            .read()
            .values()
            .find(|record| &record.id == migration_id)
            .cloned()
    }

    pub fn is_reverted(&self, migration_id: &MigrationId) -> bool {
        self.reverted.read().contains(migration_id)
    }

    /// Build the undo for `operation` by running it on a scratch copy.
    pub fn plan_compensation(
        &self,
        operation: &TypeOperation,
        state: &ProjectState,
    ) -> TaxonResult<CompensatingOperation> {
        let mut working = state.clone();
        let at = working.next_version();
        transform(operation, &mut working, at)?;
        working.advance();
        working.validate()?;
        Ok(diff_compensation(&operation.id, state, &working))
    }

    async fn store_blobs(
        &self,
        current: &ProjectState,
        working: &ProjectState,
    ) -> TaxonResult<(SnapshotRef, SnapshotRef)> {
        let before_ref = self.store.put_blob(&current.to_snapshot()).await?;
        let after_ref = self.store.put_blob(&working.to_snapshot()).await?;
        Ok((before_ref, after_ref))
    }

    /// Swap a prepared state in and index its record. Call only once the
    /// record is durable.
    pub async fn commit(&self, record: &MigrationRecord, state: &ProjectState) -> TaxonResult<()> {
        self.store
            .compare_and_swap(Some(record.version_before), state.to_snapshot())
            .await?;
        self.index(record);
        Ok(())
    }

    /// Prepare and commit in one step, for callers that keep no ledger.
    pub async fn apply(
        &self,
        operation: TypeOperation,
        compensation: Option<CompensatingOperation>,
        current: &ProjectState,
    ) -> TaxonResult<AppliedMigration> {
        let applied = self.prepare(operation, compensation, current).await?;
        if !applied.replayed {
            self.commit(&applied.record, &applied.state).await?;
        }
        Ok(applied)
    }

    /// Run a confirmed operation against a copy of `current` and build its
    /// record. Nothing is committed. An operation that already has a record
    /// is not executed again.
    #[instrument(
        skip(self, operation, compensation, current),
        fields(project_id = %operation.project_id, operation_id = %operation.id, kind = operation.kind.as_str())
    )]
    pub async fn prepare(
        &self,
        mut operation: TypeOperation,
        compensation: Option<CompensatingOperation>,
        current: &ProjectState,
    ) -> TaxonResult<AppliedMigration> {
        if let Some(record) = self.record_for(&operation.id) {
            info!(migration_id = %record.id, "operation already applied, skipping");
            operation.status = OperationStatus::Applied;
            operation.migration_id = Some(record.id.clone());
            return Ok(AppliedMigration {
                record,
                operation,
                state: current.clone(),
                replayed: true,
            });
        }
        if operation.project_id != current.project_id {
            return Err(TaxonError::Consistency(format!(
                "operation {} belongs to project {}",
                operation.id, operation.project_id
            )));
        }
        if operation.status != OperationStatus::Confirmed {
            return Err(TaxonError::Consistency(format!(
                "operation {} is {:?}, only confirmed operations are applied",
                operation.id, operation.status
            )));
        }
        for id in operation.touched_type_ids() {
            if let Some(definition) = current.registry.get(&id)
                && definition.last_modified_at_version > operation.based_on_version
            {
                warn!(type_id = %id, "type changed since diagnosis");
                return Err(TaxonError::MigrationConflict {
                    expected: operation.based_on_version,
                    actual: definition.last_modified_at_version,
                });
            }
        }

        let mut working = current.clone();
        let at = working.next_version();
        let effects = transform(&operation, &mut working, at)?;
        working.advance();
        working.validate()?;

        let mut undo = diff_compensation(&operation.id, current, &working);
        if let Some(planned) = compensation {
            if !same_undo(&planned, &undo) {
                warn!("project moved between planning and apply");
                return Err(TaxonError::MigrationConflict {
                    expected: operation.based_on_version,
                    actual: current.version,
                });
            }
            undo.id = planned.id;
        }

        let (before_ref, after_ref) = self.store_blobs(current, &working).await?;
        let record = MigrationRecord {
            id: MigrationId::default(),
            operation_id: operation.id.clone(),
            project_id: operation.project_id.clone(),
            kind: operation.kind,
            before_snapshot_ref: before_ref,
            after_snapshot_ref: after_ref,
            applied_at: Utc::now(),
            reversible: true,
            version_before: current.version,
            version_after: working.version,
            repointed: effects.repointed,
            unresolved: effects.unresolved,
            compensation: Some(undo),
            reverses: None,
            schema_version: 1,
        };
        operation.status = OperationStatus::Applied;
        operation.migration_id = Some(record.id.clone());
        info!(
            migration_id = %record.id,
            version = record.version_after,
            repointed = record.repointed.len(),
            unresolved = record.unresolved.len(),
            "migration prepared"
        );
        Ok(AppliedMigration {
            record,
            operation,
            state: working,
            replayed: false,
        })
    }

    /// Prepare and commit an undo in one step.
    pub async fn revert(
        &self,
        record: &MigrationRecord,
        current: &ProjectState,
    ) -> TaxonResult<(MigrationRecord, ProjectState)> {
        let (reverted, state) = self.prepare_revert(record, current).await?;
        self.commit(&reverted, &state).await?;
        Ok((reverted, state))
    }

    /// Run the compensating operation of `record` on a copy of `current`.
    /// Refuses when anything the migration wrote has been changed since.
    #[instrument(skip(self, record, current), fields(project_id = %record.project_id, migration_id = %record.id))]
    pub async fn prepare_revert(
        &self,
        record: &MigrationRecord,
        current: &ProjectState,
    ) -> TaxonResult<(MigrationRecord, ProjectState)> {
        if self.is_reverted(&record.id) {
            return Err(TaxonError::Consistency(format!(
                "migration {} was already reverted",
                record.id
            )));
        }
        let undo = record
            .compensation
            .as_ref()
            .filter(|_| record.reversible)
            .ok_or_else(|| {
                TaxonError::Consistency(format!("migration {} is not reversible", record.id))
            })?;
        for (unit_id, expected) in &undo.expected_unit_versions {
            let unit = current.units.require(unit_id)?;
            if unit.version != *expected {
                return Err(TaxonError::Consistency(format!(
                    "unit {unit_id} changed after the migration (version {}, expected {expected})",
                    unit.version
                )));
            }
        }
        let touched = undo
            .restore_types
            .iter()
            .map(|definition| &definition.id)
            .chain(&undo.remove_types);
        for id in touched {
            if let Some(now) = current.registry.get(id)
                && now.last_modified_at_version > record.version_after
            {
                return Err(TaxonError::Consistency(format!(
                    "type {id} changed after the migration"
                )));
            }
        }

        let mut working = current.clone();
        let at = working.next_version();
        for definition in &undo.restore_types {
            let mut definition = definition.clone();
            definition.last_modified_at_version = at;
            working.registry.restore(definition)?;
        }
        let mut repointed = Vec::new();
        for prior in &undo.restore_units {
            let now = current.units.require(&prior.id)?;
            if now.type_id != prior.type_id {
                repointed.push(RepointedUnit {
                    unit_id: prior.id.clone(),
                    from: now.type_id.clone(),
                    to: prior.type_id.clone(),
                });
            }
            let mut restored = prior.clone();
            restored.version = now.version.saturating_add(1);
            restored.updated_at = Utc::now();
            working.units.replace(restored)?;
        }
        for id in &undo.remove_types {
            working.registry.remove_local(id)?;
        }
        working.advance();
        working.validate()?;

        let (before_ref, after_ref) = self.store_blobs(current, &working).await?;
        let reverted = MigrationRecord {
            id: MigrationId::default(),
            operation_id: undo.id.clone(),
            project_id: record.project_id.clone(),
            kind: record.kind,
            before_snapshot_ref: before_ref,
            after_snapshot_ref: after_ref,
            applied_at: Utc::now(),
            reversible: false,
            version_before: current.version,
            version_after: working.version,
            repointed,
            unresolved: Vec::new(),
            compensation: None,
            reverses: Some(record.id.clone()),
            schema_version: 1,
        };
        debug!(
            restored_types = undo.restore_types.len(),
            removed_types = undo.remove_types.len(),
            "compensation applied"
        );
        info!(reverted = %record.id, version = reverted.version_after, "undo prepared");
        Ok((reverted, working))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{add_unit, domain_type, emergent_type, project, state_with};
    use taxon_protocol::{CONCEPT, FieldKind, FieldSpec, TENSION};
    use taxon_store::MemoryProjectStore;

    async fn seeded(state: &ProjectState) -> MigrationExecutor {
        let store = Arc::new(MemoryProjectStore::new());
        store
            .compare_and_swap(None, state.to_snapshot())
            .await
            .unwrap();
        MigrationExecutor::new(store)
    }

    fn confirmed(
        plan: MigrationPlan,
        sources: &[&str],
        targets: &[&str],
        state: &ProjectState,
    ) -> TypeOperation {
        let mut op = TypeOperation::new(
            project(),
            plan,
            sources.iter().map(|s| TypeDefId::from(*s)).collect(),
            targets.iter().map(|s| TypeDefId::from(*s)).collect(),
            "test",
            state.version,
        );
        op.status = OperationStatus::Confirmed;
        op
    }

    /// Comparable content of a state, without versions and timestamps.
    fn content(state: &ProjectState) -> Vec<String> {
        let mut out: Vec<String> = state
            .registry
            .definitions()
            .into_iter()
            .map(|d| {
                format!(
                    "{}|{:?}|{:?}|{:?}|{:?}|{}|{:?}",
                    d.id,
                    d.tier,
                    d.extends,
                    d.aliases,
                    d.status,
                    d.frozen,
                    d.schema.iter().map(|f| &f.name).collect::<Vec<_>>()
                )
            })
            .collect();
        out.extend(
            state
                .units
                .all()
                .map(|u| format!("{}|{}|{:?}", u.id, u.type_id, u.display_fields)),
        );
        out
    }

    #[tokio::test]
    async fn merge_moves_every_unit_to_survivor() {
        let hazard = domain_type("Hazard", CONCEPT).with_field(FieldSpec::new(
            "likelihood",
            FieldKind::Number,
            &TypeDefId::from("hazard"),
        ));
        let mut state = state_with(vec![
            domain_type("Risk", CONCEPT),
            hazard,
            domain_type("Flood Hazard", "hazard"),
        ]);
        add_unit(&mut state, "risk", "Default", "credit");
        add_unit(&mut state, "risk", "Liquidity", "cash");
        add_unit(&mut state, "hazard", "Flood", "water");
        let before = state.units.count_by_type();
        let expected = before[&TypeDefId::from("risk")] + before[&TypeDefId::from("hazard")];

        let executor = seeded(&state).await;
        let op = confirmed(
            MigrationPlan::Merge {
                sources: vec!["hazard".into()],
                survivor: "risk".into(),
            },
            &["hazard"],
            &["risk"],
            &state,
        );
        let applied = executor.apply(op, None, &state).await.unwrap();
        let after = &applied.state;

        assert_eq!(after.units.by_type(&"risk".into()).len(), expected);
        assert!(after.units.by_type(&"hazard".into()).is_empty());
        assert_eq!(applied.record.repointed.len(), 1);

        let survivor = after.registry.get(&"risk".into()).unwrap();
        let likelihood = survivor.field("likelihood").unwrap();
        assert_eq!(likelihood.origin.type_id.as_str(), "hazard");
        assert_eq!(
            survivor.field("name").unwrap().contributed_by,
            vec![TypeDefId::from("hazard")]
        );
        assert_eq!(
            after.registry.get(&"hazard".into()).unwrap().status,
            TypeStatus::MergedInto {
                target: "risk".into()
            }
        );
        assert_eq!(
            after.registry.get(&"flood_hazard".into()).unwrap().extends,
            Some(TypeDefId::from("risk"))
        );
        assert_eq!(after.version, state.version + 1);
    }

    #[tokio::test]
    async fn split_accounts_for_every_unit() {
        let mut state = state_with(vec![domain_type("Market Force", CONCEPT)]);
        let rates = add_unit(&mut state, "market_force", "Rates", "central bank");
        let brand = add_unit(&mut state, "market_force", "Brand", "pricing power");
        let stray = add_unit(&mut state, "market_force", "Weather", "storms");
        let pre_split = units_of(&state, &"market_force".into());

        let macro_force = emergent_type("Macro Force", CONCEPT);
        let company_force = emergent_type("Company Force", CONCEPT);
        let assignments = BTreeMap::from([
            (
                rates.clone(),
                SplitAssignment::Resolved {
                    target: macro_force.id.clone(),
                },
            ),
            (
                brand.clone(),
                SplitAssignment::Resolved {
                    target: company_force.id.clone(),
                },
            ),
        ]);
        let op = confirmed(
            MigrationPlan::Split {
                source: "market_force".into(),
                targets: vec![macro_force, company_force],
                assignments,
            },
            &["market_force"],
            &["macro_force", "company_force"],
            &state,
        )
        .with_affected_units(pre_split.clone());

        let executor = seeded(&state).await;
        let applied = executor.apply(op, None, &state).await.unwrap();
        let record = &applied.record;

        for unit_id in &pre_split {
            let repointed = record.repointed.iter().any(|r| &r.unit_id == unit_id);
            let unresolved = record.unresolved.iter().any(|u| &u.unit_id == unit_id);
            assert!(repointed ^ unresolved, "unit {unit_id} unaccounted for");
        }
        assert_eq!(record.unresolved.len(), 1);
        assert_eq!(record.unresolved[0].unit_id, stray);
        let after = &applied.state;
        assert_eq!(after.units.get(&rates).unwrap().type_id.as_str(), "macro_force");
        assert_eq!(after.units.get(&stray).unwrap().type_id.as_str(), "market_force");
        assert_eq!(
            after.registry.get(&"market_force".into()).unwrap().status,
            TypeStatus::Hidden
        );
    }

    #[tokio::test]
    async fn undo_then_reapply_matches_first_application() {
        let mut state = state_with(vec![domain_type("Hazard", CONCEPT), domain_type("Risk", CONCEPT)]);
        add_unit(&mut state, "hazard", "Flood", "water");
        add_unit(&mut state, "risk", "Default", "credit");
        let executor = seeded(&state).await;

        let op = confirmed(
            MigrationPlan::Merge {
                sources: vec!["hazard".into()],
                survivor: "risk".into(),
            },
            &["hazard"],
            &["risk"],
            &state,
        );
        let compensation = executor.plan_compensation(&op, &state).unwrap();
        assert_eq!(compensation.reverses, op.id);
        let first = executor
            .apply(op, Some(compensation), &state)
            .await
            .unwrap();
        let after_first = content(&first.state);

        let (undo_record, undone) = executor.revert(&first.record, &first.state).await.unwrap();
        assert_eq!(undo_record.reverses.as_ref(), Some(&first.record.id));
        assert_eq!(content(&undone), content(&state));

        let again = first.operation.reissue(undone.version);
        let second = executor.apply(again, None, &undone).await.unwrap();
        assert_eq!(content(&second.state), after_first);
        assert_eq!(second.state.version, state.version + 3);
    }

    #[tokio::test]
    async fn split_undo_removes_created_types() {
        let mut state = state_with(vec![domain_type("Market Force", CONCEPT)]);
        let rates = add_unit(&mut state, "market_force", "Rates", "central bank");
        let macro_force = emergent_type("Macro Force", CONCEPT);
        let op = confirmed(
            MigrationPlan::Split {
                source: "market_force".into(),
                targets: vec![macro_force.clone(), emergent_type("Company Force", CONCEPT)],
                assignments: BTreeMap::from([(
                    rates.clone(),
                    SplitAssignment::Resolved {
                        target: macro_force.id.clone(),
                    },
                )]),
            },
            &["market_force"],
            &["macro_force", "company_force"],
            &state,
        );
        let executor = seeded(&state).await;
        let applied = executor.apply(op, None, &state).await.unwrap();
        let (_, undone) = executor
            .revert(&applied.record, &applied.state)
            .await
            .unwrap();
        assert!(!undone.registry.contains(&"macro_force".into()));
        assert_eq!(content(&undone), content(&state));
        assert!(
            executor
                .revert(&applied.record, &undone)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn revert_refuses_to_clobber_later_edits() {
        let mut state = state_with(vec![domain_type("Hazard", CONCEPT), domain_type("Risk", CONCEPT)]);
        let flood = add_unit(&mut state, "hazard", "Flood", "water");
        let executor = seeded(&state).await;
        let op = confirmed(
            MigrationPlan::Merge {
                sources: vec!["hazard".into()],
                survivor: "risk".into(),
            },
            &["hazard"],
            &["risk"],
            &state,
        );
        let applied = executor.apply(op, None, &state).await.unwrap();
        let mut edited = applied.state.clone();
        let mut unit = edited.units.get(&flood).unwrap().clone();
        unit.bump_version();
        edited.units.replace(unit).unwrap();

        let err = executor.revert(&applied.record, &edited).await.unwrap_err();
        assert!(matches!(err, TaxonError::Consistency(_)));
    }

    #[tokio::test]
    async fn stale_operation_conflicts() {
        let state = state_with(vec![domain_type("Moat", CONCEPT)]);
        let executor = seeded(&state).await;
        let hide = confirmed(
            MigrationPlan::Hide {
                type_id: "moat".into(),
            },
            &["moat"],
            &[],
            &state,
        );
        let rename = confirmed(
            MigrationPlan::Rename {
                type_id: "moat".into(),
                new_alias: "Durable Advantage".into(),
            },
            &["moat"],
            &[],
            &state,
        );
        let first = executor.apply(rename, None, &state).await.unwrap();
        let err = executor.apply(hide, None, &first.state).await.unwrap_err();
        assert!(matches!(
            err,
            TaxonError::MigrationConflict {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn reapplying_the_same_operation_is_a_no_op() {
        let state = state_with(vec![domain_type("Moat", CONCEPT)]);
        let executor = seeded(&state).await;
        let hide = confirmed(
            MigrationPlan::Hide {
                type_id: "moat".into(),
            },
            &["moat"],
            &[],
            &state,
        );
        let first = executor.apply(hide.clone(), None, &state).await.unwrap();
        let second = executor.apply(hide, None, &first.state).await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.state.version, first.state.version);
    }

    #[tokio::test]
    async fn prepared_migration_leaves_store_untouched_until_commit() {
        let state = state_with(vec![domain_type("Moat", CONCEPT)]);
        let store = Arc::new(MemoryProjectStore::new());
        store.compare_and_swap(None, state.to_snapshot()).await.unwrap();
        let executor = MigrationExecutor::new(store.clone());
        let hide = confirmed(
            MigrationPlan::Hide {
                type_id: "moat".into(),
            },
            &["moat"],
            &[],
            &state,
        );

        let prepared = executor.prepare(hide.clone(), None, &state).await.unwrap();
        let stored = store.load(&state.project_id).await.unwrap().unwrap();
        assert_eq!(stored.version, state.version);
        assert!(executor.record_for(&hide.id).is_none());
        let after = store
            .get_blob(&prepared.record.after_snapshot_ref)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.version, prepared.record.version_after);

        executor.commit(&prepared.record, &prepared.state).await.unwrap();
        let stored = store.load(&state.project_id).await.unwrap().unwrap();
        assert_eq!(stored.version, prepared.record.version_after);
        assert_eq!(executor.record_for(&hide.id), Some(prepared.record));
    }

    #[tokio::test]
    async fn aborted_records_drop_out_of_the_index() {
        let state = state_with(vec![domain_type("Moat", CONCEPT)]);
        let executor = seeded(&state).await;
        let hide = confirmed(
            MigrationPlan::Hide {
                type_id: "moat".into(),
            },
            &["moat"],
            &[],
            &state,
        );
        let prepared = executor.prepare(hide.clone(), None, &state).await.unwrap();
        executor.ingest(&LedgerEntry::MigrationApplied {
            record: prepared.record.clone(),
            operation: prepared.operation.clone(),
        });
        assert!(executor.record_for(&hide.id).is_some());
        executor.ingest(&LedgerEntry::MigrationAborted {
            migration_id: prepared.record.id.clone(),
            reason: "swap failed".into(),
        });
        assert!(executor.record_for(&hide.id).is_none());
        assert!(executor.find(&prepared.record.id).is_none());
    }

    #[tokio::test]
    async fn renaming_a_universal_alias_keeps_units() {
        let mut state = state_with(vec![]);
        let unit = add_unit(&mut state, TENSION, "Growth vs margin", "trade-off");
        let executor = seeded(&state).await;
        let rename = confirmed(
            MigrationPlan::Rename {
                type_id: TENSION.into(),
                new_alias: "Strategic Tension".into(),
            },
            &[TENSION],
            &[],
            &state,
        );
        let applied = executor.apply(rename, None, &state).await.unwrap();
        let tension = applied.state.registry.get(&TENSION.into()).unwrap();
        assert_eq!(tension.aliases, vec!["Dialectic", "Strategic Tension"]);
        assert_eq!(tension.tier, Tier::Universal);
        assert_eq!(applied.state.units.get(&unit), state.units.get(&unit));
        assert!(applied.record.repointed.is_empty());
    }

    #[tokio::test]
    async fn universal_merge_is_a_consistency_error() {
        let state = state_with(vec![domain_type("Moat", CONCEPT)]);
        let executor = seeded(&state).await;
        let merge = confirmed(
            MigrationPlan::Merge {
                sources: vec!["moat".into()],
                survivor: CONCEPT.into(),
            },
            &["moat"],
            &[CONCEPT],
            &state,
        );
        let err = executor.apply(merge, None, &state).await.unwrap_err();
        assert!(matches!(err, TaxonError::Consistency(_)));
    }

    #[tokio::test]
    async fn merge_into_universal_is_refused_when_only_the_plan_names_it() {
        let mut state = state_with(vec![domain_type("Moat", CONCEPT)]);
        add_unit(&mut state, "moat", "Network effects", "lock-in");
        let executor = seeded(&state).await;
        let merge = confirmed(
            MigrationPlan::Merge {
                sources: vec!["moat".into()],
                survivor: CONCEPT.into(),
            },
            &[],
            &[],
            &state,
        );
        assert!(executor.plan_compensation(&merge, &state).is_err());
        let err = executor.apply(merge, None, &state).await.unwrap_err();
        assert!(matches!(err, TaxonError::Consistency(_)));
    }

    #[tokio::test]
    async fn lists_that_disagree_with_the_plan_are_refused() {
        let state = state_with(vec![domain_type("Moat", CONCEPT), domain_type("Risk", CONCEPT)]);
        let executor = seeded(&state).await;
        let hide = confirmed(
            MigrationPlan::Hide {
                type_id: "moat".into(),
            },
            &["risk"],
            &[],
            &state,
        );
        let err = executor.apply(hide, None, &state).await.unwrap_err();
        assert!(matches!(err, TaxonError::Consistency(_)));
    }

    #[tokio::test]
    async fn promote_freezes_and_demote_unfreezes() {
        let tracked = emergent_type("Flywheel", CONCEPT).with_field(
            FieldSpec::new("mentions", FieldKind::Number, &TypeDefId::from("flywheel")).tracking(),
        );
        let state = state_with(vec![tracked]);
        let executor = seeded(&state).await;
        let promote = confirmed(
            MigrationPlan::Promote {
                type_id: "flywheel".into(),
            },
            &["flywheel"],
            &[],
            &state,
        );
        let promoted = executor.apply(promote, None, &state).await.unwrap();
        let definition = promoted.state.registry.get(&"flywheel".into()).unwrap();
        assert_eq!(definition.tier, Tier::Domain);
        assert!(definition.frozen);
        assert!(definition.field("mentions").unwrap().inert);
        assert_eq!(definition.revision, 2);

        let demote = confirmed(
            MigrationPlan::Demote {
                type_id: "flywheel".into(),
            },
            &["flywheel"],
            &[],
            &promoted.state,
        );
        let demoted = executor.apply(demote, None, &promoted.state).await.unwrap();
        let definition = demoted.state.registry.get(&"flywheel".into()).unwrap();
        assert_eq!(definition.tier, Tier::Emergent);
        assert!(!definition.frozen);
    }

    #[tokio::test]
    async fn create_enforces_chain_depth() {
        let state = state_with(vec![
            domain_type("Force", CONCEPT),
            domain_type("Market Force", "force"),
        ]);
        let executor = seeded(&state).await;
        let too_deep = emergent_type("Rate Force", "market_force");
        let create = confirmed(
            MigrationPlan::Create {
                definition: too_deep,
            },
            &[],
            &["rate_force"],
            &state,
        );
        let err = executor.apply(create, None, &state).await.unwrap_err();
        assert!(matches!(err, TaxonError::Consistency(_)));

        let fine = confirmed(
            MigrationPlan::Create {
                definition: emergent_type("Rate Force", "force"),
            },
            &[],
            &["rate_force"],
            &state,
        );
        let applied = executor.apply(fine, None, &state).await.unwrap();
        assert_eq!(
            applied.state.registry.root_of(&"rate_force".into()).unwrap().as_str(),
            CONCEPT
        );
    }
}
