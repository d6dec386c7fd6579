//! Unit store: typed knowledge units conforming to the registry.

use std::collections::BTreeMap;

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use taxon_protocol::{
    RepointedUnit, TYPE_OVERRIDE_FIELD, TaxonError, TaxonResult, TypeDefId, Unit, UnitId,
};

use crate::registry::TypeRegistry;

#[derive(Debug, Clone, Default)]
pub struct UnitStore {
    units: IndexMap<UnitId, Unit>,
}

impl UnitStore {
    pub fn from_units(units: Vec<Unit>) -> Self {
        Self {
            units: units
                .into_iter()
                .map(|unit| (unit.id.clone(), unit))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, id: &UnitId) -> Option<&Unit> {
        self.units.get(id)
    }

    pub fn require(&self, id: &UnitId) -> TaxonResult<&Unit> {
        self.units
            .get(id)
            .ok_or_else(|| TaxonError::NotFound(format!("unit {id}")))
    }

    pub fn all(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn to_vec(&self) -> Vec<Unit> {
        self.units.values().cloned().collect()
    }

    pub fn by_type(&self, type_id: &TypeDefId) -> Vec<&Unit> {
        self.units
            .values()
            .filter(|unit| &unit.type_id == type_id)
            .collect()
    }

    pub fn count_by_type(&self) -> BTreeMap<TypeDefId, usize> {
        let mut counts = BTreeMap::new();
        for unit in self.units.values() {
            *counts.entry(unit.type_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Add a new unit. Its type must be live and every required field of
    /// the current schema present.
    pub fn insert(&mut self, mut unit: Unit, registry: &TypeRegistry) -> TaxonResult<()> {
        if self.units.contains_key(&unit.id) {
            return Err(TaxonError::Consistency(format!(
                "unit {} already exists",
                unit.id
            )));
        }
        let definition = registry.require(&unit.type_id)?;
        if !definition.status.is_live() {
            return Err(TaxonError::Consistency(format!(
                "type {} is {:?} and cannot take new units",
                definition.id, definition.status
            )));
        }
        for field in definition.schema.iter().filter(|field| field.required) {
            let present = unit
                .display_fields
                .get(&field.name)
                .is_some_and(|value| !value.is_null());
            if !present {
                return Err(TaxonError::Validation(format!(
                    "unit {} is missing required field {}",
                    unit.id, field.name
                )));
            }
        }
        unit.type_revision = definition.revision;
        self.units.insert(unit.id.clone(), unit);
        Ok(())
    }

    /// Replace a unit row wholesale. Used for revisions and before-image
    /// restores; the caller owns version bookkeeping.
    pub fn replace(&mut self, unit: Unit) -> TaxonResult<()> {
        match self.units.get_mut(&unit.id) {
            Some(slot) => {
                *slot = unit;
                Ok(())
            }
            None => Err(TaxonError::NotFound(format!("unit {}", unit.id))),
        }
    }

    /// Point a unit at another live type. Bumps the unit version.
    pub fn repoint(
        &mut self,
        id: &UnitId,
        to: &TypeDefId,
        registry: &TypeRegistry,
    ) -> TaxonResult<RepointedUnit> {
        let target = registry.require(to)?;
        if !target.status.is_live() {
            return Err(TaxonError::Consistency(format!(
                "cannot re-point unit {id} to {to}, which is {:?}",
                target.status
            )));
        }
        let revision = target.revision;
        let unit = self
            .units
            .get_mut(id)
            .ok_or_else(|| TaxonError::NotFound(format!("unit {id}")))?;
        let from = std::mem::replace(&mut unit.type_id, to.clone());
        unit.type_revision = revision;
        unit.bump_version();
        Ok(RepointedUnit {
            unit_id: id.clone(),
            from,
            to: to.clone(),
        })
    }

    /// Read a unit upgraded to its type's current schema revision. Fields
    /// added since the unit's revision are filled with `null`; nothing is
    /// written back.
    pub fn get_upgraded(&self, id: &UnitId, registry: &TypeRegistry) -> TaxonResult<Unit> {
        let unit = self.require(id)?;
        let definition = registry.require(&unit.type_id)?;
        if unit.type_revision >= definition.revision {
            return Ok(unit.clone());
        }
        let known: Vec<&str> = registry
            .schema_at(&unit.type_id, unit.type_revision)
            .map(|schema| schema.iter().map(|field| field.name.as_str()).collect())
            .unwrap_or_default();
        let mut upgraded = unit.clone();
        for field in &definition.schema {
            if field.inert || known.contains(&field.name.as_str()) {
                continue;
            }
            upgraded
                .display_fields
                .entry(field.name.clone())
                .or_insert(Value::Null);
        }
        upgraded.type_revision = definition.revision;
        Ok(upgraded)
    }

    /// Set a unit's free-text type override, or clear it with `None`.
    pub fn set_type_override(&mut self, id: &UnitId, text: Option<&str>) -> TaxonResult<()> {
        let unit = self
            .units
            .get_mut(id)
            .ok_or_else(|| TaxonError::NotFound(format!("unit {id}")))?;
        match text {
            Some(text) => {
                unit.display_fields
                    .insert(TYPE_OVERRIDE_FIELD.to_owned(), Value::from(text));
            }
            None => {
                unit.display_fields.shift_remove(TYPE_OVERRIDE_FIELD);
            }
        }
        unit.updated_at = Utc::now();
        Ok(())
    }

    /// Every unit references a live type.
    pub fn validate(&self, registry: &TypeRegistry) -> TaxonResult<()> {
        for unit in self.units.values() {
            if !registry.is_live(&unit.type_id) {
                return Err(TaxonError::Consistency(format!(
                    "unit {} references type {}, which is not live",
                    unit.id, unit.type_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctrine::DoctrineBase;
    use taxon_protocol::{
        CONCEPT, FieldKind, FieldSpec, GenesisId, ProjectId, TENSION, Tier, TypeDefinition,
        TypeStatus,
    };

    fn registry() -> TypeRegistry {
        let base = DoctrineBase::with_universal_seed();
        TypeRegistry::new(base.view(), base.inheritable_ids())
    }

    fn concept(name: &str) -> Unit {
        Unit::new(
            ProjectId::from_string("p"),
            TypeDefId::from_string(CONCEPT),
            1,
            "finance",
            GenesisId::default(),
        )
        .with_field("name", name)
    }

    #[test]
    fn insert_requires_required_fields() {
        let registry = registry();
        let mut store = UnitStore::default();
        let nameless = Unit::new(
            ProjectId::from_string("p"),
            TypeDefId::from_string(CONCEPT),
            1,
            "finance",
            GenesisId::default(),
        );
        assert!(matches!(
            store.insert(nameless, &registry),
            Err(TaxonError::Validation(_))
        ));
        store.insert(concept("Liquidity"), &registry).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn insert_rejects_unknown_type() {
        let registry = registry();
        let mut store = UnitStore::default();
        let mut unit = concept("x");
        unit.type_id = TypeDefId::from_string("nope");
        assert!(matches!(
            store.insert(unit, &registry),
            Err(TaxonError::NotFound(_))
        ));
    }

    #[test]
    fn repoint_bumps_version_and_reports_move() {
        let registry = registry();
        let mut store = UnitStore::default();
        let unit = concept("Rate hike");
        let id = unit.id.clone();
        store.insert(unit, &registry).unwrap();
        let moved = store
            .repoint(&id, &TypeDefId::from_string(TENSION), &registry)
            .unwrap();
        assert_eq!(moved.from.as_str(), CONCEPT);
        assert_eq!(store.require(&id).unwrap().version, 2);
    }

    #[test]
    fn repoint_to_merged_type_is_refused() {
        let mut registry = registry();
        let mut gone = TypeDefinition::new(
            TypeDefId::from_string("old"),
            Tier::Domain,
            Some(TypeDefId::from_string(CONCEPT)),
            "Old",
        );
        gone.status = TypeStatus::MergedInto {
            target: TypeDefId::from_string(CONCEPT),
        };
        registry.put(gone, 1).unwrap();
        let mut store = UnitStore::default();
        let unit = concept("x");
        let id = unit.id.clone();
        store.insert(unit, &registry).unwrap();
        assert!(store.repoint(&id, &TypeDefId::from_string("old"), &registry).is_err());
    }

    #[test]
    fn lazy_upgrade_fills_new_fields_without_writing_back() {
        let mut registry = registry();
        let mut store = UnitStore::default();
        let unit = concept("Liquidity");
        let id = unit.id.clone();
        store.insert(unit, &registry).unwrap();

        let concept_id = TypeDefId::from_string(CONCEPT);
        let widened = registry
            .require(&concept_id)
            .unwrap()
            .clone()
            .with_field(FieldSpec::new("examples", FieldKind::List, &concept_id));
        registry.put(widened, 1).unwrap();

        let upgraded = store.get_upgraded(&id, &registry).unwrap();
        assert_eq!(upgraded.type_revision, 2);
        assert_eq!(upgraded.display_fields.get("examples"), Some(&Value::Null));
        assert_eq!(store.require(&id).unwrap().type_revision, 1);
    }

    #[test]
    fn override_round_trip() {
        let registry = registry();
        let mut store = UnitStore::default();
        let unit = concept("x");
        let id = unit.id.clone();
        store.insert(unit, &registry).unwrap();
        store.set_type_override(&id, Some("Macro shock")).unwrap();
        assert_eq!(store.require(&id).unwrap().type_override(), Some("Macro shock"));
        store.set_type_override(&id, None).unwrap();
        assert_eq!(store.require(&id).unwrap().type_override(), None);
    }
}
