//! Shared builders for unit tests.

use std::sync::Arc;

use taxon_protocol::{
    FieldKind, FieldSpec, GenesisId, ProjectId, Tier, TypeDefId, TypeDefinition, Unit, UnitId,
};
use taxon_registry::{DoctrineBase, ProjectState};

pub(crate) fn project() -> ProjectId {
    ProjectId::from_string("research")
}

pub(crate) fn typed(name: &str, tier: Tier, parent: &str) -> TypeDefinition {
    let id = TypeDefId::slug(name);
    TypeDefinition::new(id.clone(), tier, Some(TypeDefId::from(parent)), name)
        .with_field(FieldSpec::new("name", FieldKind::Text, &id).required())
        .with_field(FieldSpec::new("definition", FieldKind::LongText, &id))
}

pub(crate) fn domain_type(name: &str, parent: &str) -> TypeDefinition {
    typed(name, Tier::Domain, parent)
}

pub(crate) fn emergent_type(name: &str, parent: &str) -> TypeDefinition {
    typed(name, Tier::Emergent, parent)
}

pub(crate) fn state_with(types: Vec<TypeDefinition>) -> ProjectState {
    let doctrine = Arc::new(DoctrineBase::with_universal_seed());
    let mut state = ProjectState::new(project(), &doctrine);
    for definition in types {
        state
            .registry
            .put(definition, 0)
            .expect("fixture type is well formed");
    }
    state
}

pub(crate) fn add_unit(
    state: &mut ProjectState,
    type_id: &str,
    name: &str,
    definition: &str,
) -> UnitId {
    let unit = Unit::new(
        state.project_id.clone(),
        TypeDefId::from(type_id),
        1,
        "markets",
        GenesisId::from_string(format!("g-{name}")),
    )
    .with_field("name", name)
    .with_field("definition", definition);
    let id = unit.id.clone();
    state
        .units
        .insert(unit, &state.registry)
        .expect("fixture unit is valid");
    id
}
