//! The (TypeRegistry, UnitStore) pair of one project under a single version.

use std::sync::Arc;

use chrono::Utc;
use taxon_protocol::{ProjectId, ProjectSnapshot, TaxonError, TaxonResult};

use crate::doctrine::DoctrineBase;
use crate::registry::TypeRegistry;
use crate::units::UnitStore;

#[derive(Debug, Clone)]
pub struct ProjectState {
    pub project_id: ProjectId,
    /// Bumped once per committed change to either half.
    pub version: u64,
    pub registry: TypeRegistry,
    pub units: UnitStore,
}

impl ProjectState {
    /// Fresh project inheriting the doctrine as it stands now.
    pub fn new(project_id: ProjectId, doctrine: &Arc<DoctrineBase>) -> Self {
        Self {
            project_id,
            version: 0,
            registry: TypeRegistry::new(doctrine.view(), doctrine.inheritable_ids()),
            units: UnitStore::default(),
        }
    }

    pub fn from_snapshot(snapshot: ProjectSnapshot, doctrine: &Arc<DoctrineBase>) -> Self {
        Self {
            project_id: snapshot.project_id,
            version: snapshot.version,
            registry: TypeRegistry::from_parts(
                doctrine.view(),
                snapshot.inherited,
                snapshot.types,
                snapshot.schema_history,
            ),
            units: UnitStore::from_units(snapshot.units),
        }
    }

    pub fn to_snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            project_id: self.project_id.clone(),
            version: self.version,
            inherited: self.registry.inherited_ids(),
            types: self.registry.overlay(),
            schema_history: self.registry.history().to_vec(),
            units: self.units.to_vec(),
            saved_at: Utc::now(),
            schema_version: 1,
        }
    }

    /// Version the next committed change will carry.
    pub fn next_version(&self) -> u64 {
        self.version + 1
    }

    /// Seal a working copy as the next version.
    pub fn advance(&mut self) {
        self.version = self.next_version();
    }

    /// Registry and store invariants together.
    pub fn validate(&self) -> TaxonResult<()> {
        self.registry.validate()?;
        self.units.validate(&self.registry)?;
        for unit in self.units.all() {
            if unit.project_id != self.project_id {
                return Err(TaxonError::Consistency(format!(
                    "unit {} belongs to project {}",
                    unit.id, unit.project_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxon_protocol::{CONCEPT, GenesisId, TENSION, TypeDefId, Unit};

    #[test]
    fn snapshot_round_trip_keeps_overlay_and_units() {
        let doctrine = Arc::new(DoctrineBase::with_universal_seed());
        let project = ProjectId::from_string("p");
        let mut state = ProjectState::new(project.clone(), &doctrine);

        let tension_id = TypeDefId::from_string(TENSION);
        let mut tension = state.registry.require(&tension_id).unwrap().clone();
        tension.aliases.push("Strategic Tension".into());
        let next = state.next_version();
        state.registry.put(tension, next).unwrap();
        let unit = Unit::new(
            project.clone(),
            TypeDefId::from_string(CONCEPT),
            1,
            "strategy",
            GenesisId::default(),
        )
        .with_field("name", "Moat");
        state.units.insert(unit, &state.registry).unwrap();
        state.advance();

        let restored = ProjectState::from_snapshot(state.to_snapshot(), &doctrine);
        restored.validate().unwrap();
        assert_eq!(restored.version, 1);
        assert_eq!(restored.units.len(), 1);
        assert_eq!(
            restored.registry.require(&tension_id).unwrap().display_name(),
            "Strategic Tension"
        );
    }

    #[test]
    fn foreign_units_fail_validation() {
        let doctrine = Arc::new(DoctrineBase::with_universal_seed());
        let mut state = ProjectState::new(ProjectId::from_string("p"), &doctrine);
        let unit = Unit::new(
            ProjectId::from_string("other"),
            TypeDefId::from_string(CONCEPT),
            1,
            "x",
            GenesisId::default(),
        )
        .with_field("name", "x");
        state.units.insert(unit, &state.registry).unwrap();
        assert!(state.validate().is_err());
    }
}
