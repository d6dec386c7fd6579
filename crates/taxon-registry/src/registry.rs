//! Per-project type registry: a copy-on-write overlay over the doctrine view.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use taxon_protocol::{
    FieldSpec, MAX_EXTENDS_HOPS, SchemaRevision, TaxonError, TaxonResult, Tier, TypeDefId,
    TypeDefinition, TypeStatus, UNIVERSAL_TYPE_IDS, is_universal_id,
};

use crate::doctrine::DoctrineView;

#[derive(Debug, Clone)]
pub struct TypeRegistry {
    base: DoctrineView,
    inherited: BTreeSet<TypeDefId>,
    overlay: IndexMap<TypeDefId, TypeDefinition>,
    history: Vec<SchemaRevision>,
}

impl TypeRegistry {
    /// Registry that inherits `inherited` from `base` and has no local changes.
    pub fn new(base: DoctrineView, inherited: impl IntoIterator<Item = TypeDefId>) -> Self {
        Self {
            base,
            inherited: inherited.into_iter().collect(),
            overlay: IndexMap::new(),
            history: Vec::new(),
        }
    }

    pub fn from_parts(
        base: DoctrineView,
        inherited: Vec<TypeDefId>,
        overlay: Vec<TypeDefinition>,
        history: Vec<SchemaRevision>,
    ) -> Self {
        Self {
            base,
            inherited: inherited.into_iter().collect(),
            overlay: overlay
                .into_iter()
                .map(|definition| (definition.id.clone(), definition))
                .collect(),
            history,
        }
    }

    pub fn inherited_ids(&self) -> Vec<TypeDefId> {
        self.inherited.iter().cloned().collect()
    }

    pub fn overlay(&self) -> Vec<TypeDefinition> {
        self.overlay.values().cloned().collect()
    }

    pub fn history(&self) -> &[SchemaRevision] {
        &self.history
    }

    pub fn get(&self, id: &TypeDefId) -> Option<&TypeDefinition> {
        if let Some(local) = self.overlay.get(id) {
            return Some(local);
        }
        if self.inherited.contains(id) {
            return self.base.get(id);
        }
        None
    }

    pub fn require(&self, id: &TypeDefId) -> TaxonResult<&TypeDefinition> {
        self.get(id)
            .ok_or_else(|| TaxonError::NotFound(format!("type {id}")))
    }

    pub fn contains(&self, id: &TypeDefId) -> bool {
        self.get(id).is_some()
    }

    /// Whether the definition is project-local (created here, not inherited).
    pub fn is_local(&self, id: &TypeDefId) -> bool {
        self.overlay.contains_key(id) && !self.inherited.contains(id)
    }

    /// All definitions: inherited ones in doctrine order, then local ones.
    pub fn definitions(&self) -> Vec<&TypeDefinition> {
        let mut out: Vec<&TypeDefinition> = self
            .base
            .keys()
            .filter(|id| self.inherited.contains(*id))
            .filter_map(|id| self.get(id))
            .collect();
        out.extend(
            self.overlay
                .values()
                .filter(|definition| !self.inherited.contains(&definition.id)),
        );
        out
    }

    pub fn live_definitions(&self) -> Vec<&TypeDefinition> {
        self.definitions()
            .into_iter()
            .filter(|definition| definition.status.is_live())
            .collect()
    }

    pub fn is_live(&self, id: &TypeDefId) -> bool {
        self.get(id)
            .is_some_and(|definition| definition.status.is_live())
    }

    /// Live type whose display name or any earlier alias matches `name`,
    /// case-insensitively, or whose id equals its slug.
    pub fn resolve_name(&self, name: &str) -> Option<&TypeDefinition> {
        let wanted = name.trim().to_lowercase();
        let slug = TypeDefId::slug(name);
        self.live_definitions().into_iter().find(|definition| {
            definition.id == slug
                || definition
                    .aliases
                    .iter()
                    .any(|alias| alias.to_lowercase() == wanted)
        })
    }

    pub fn children_of(&self, id: &TypeDefId) -> Vec<TypeDefId> {
        self.definitions()
            .into_iter()
            .filter(|definition| definition.extends.as_ref() == Some(id))
            .map(|definition| definition.id.clone())
            .collect()
    }

    /// The `extends` chain from `id` up to and including its Universal root.
    pub fn chain(&self, id: &TypeDefId) -> TaxonResult<Vec<TypeDefId>> {
        let mut chain = vec![id.clone()];
        let mut current = self.require(id)?;
        while !current.is_universal() {
            let Some(parent_id) = &current.extends else {
                return Err(TaxonError::Consistency(format!(
                    "type {} has no parent",
                    current.id
                )));
            };
            if chain.contains(parent_id) {
                return Err(TaxonError::Consistency(format!(
                    "extends cycle through {parent_id}"
                )));
            }
            let parent = self.get(parent_id).ok_or_else(|| {
                TaxonError::Consistency(format!(
                    "type {} extends missing type {parent_id}",
                    current.id
                ))
            })?;
            if !parent.status.is_live() {
                return Err(TaxonError::Consistency(format!(
                    "type {} extends {parent_id}, which is {:?}",
                    current.id, parent.status
                )));
            }
            chain.push(parent_id.clone());
            if chain.len() - 1 > MAX_EXTENDS_HOPS {
                return Err(TaxonError::Consistency(format!(
                    "type {id} is more than {MAX_EXTENDS_HOPS} hops from a universal type"
                )));
            }
            current = parent;
        }
        Ok(chain)
    }

    /// Universal root of `id`.
    pub fn root_of(&self, id: &TypeDefId) -> TaxonResult<TypeDefId> {
        let chain = self.chain(id)?;
        chain
            .last()
            .cloned()
            .ok_or_else(|| TaxonError::Consistency(format!("empty chain for {id}")))
    }

    /// Schema a unit written against `(id, revision)` was validated with.
    pub fn schema_at(&self, id: &TypeDefId, revision: u32) -> Option<&[FieldSpec]> {
        if let Some(current) = self.get(id)
            && current.revision == revision
        {
            return Some(&current.schema);
        }
        self.history
            .iter()
            .find(|entry| &entry.type_id == id && entry.revision == revision)
            .map(|entry| entry.schema.as_slice())
    }

    /// Insert or replace a definition in the overlay. A changed schema bumps
    /// the revision and archives the previous one.
    pub fn put(&mut self, mut definition: TypeDefinition, at_version: u64) -> TaxonResult<()> {
        Self::check_tier_shape(&definition)?;
        if let Some(existing) = self.get(&definition.id).cloned() {
            if existing.schema != definition.schema && existing.revision >= definition.revision {
                definition.revision = existing.revision + 1;
            }
            if definition.revision > existing.revision {
                self.history.push(SchemaRevision {
                    type_id: existing.id.clone(),
                    revision: existing.revision,
                    schema: existing.schema.clone(),
                });
            }
        }
        definition.last_modified_at_version = at_version;
        self.overlay.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Drop a project-local definition, with its archived schemas.
    pub fn remove_local(&mut self, id: &TypeDefId) -> TaxonResult<TypeDefinition> {
        if !self.is_local(id) {
            return Err(TaxonError::Consistency(format!(
                "type {id} is not project-local and cannot be removed"
            )));
        }
        self.history.retain(|entry| &entry.type_id != id);
        self.overlay
            .shift_remove(id)
            .ok_or_else(|| TaxonError::NotFound(format!("type {id}")))
    }

    /// Restore an exact before-image, bypassing revision bookkeeping.
    pub fn restore(&mut self, definition: TypeDefinition) -> TaxonResult<()> {
        Self::check_tier_shape(&definition)?;
        let revision = definition.revision;
        self.history
            .retain(|entry| !(entry.type_id == definition.id && entry.revision >= revision));
        self.overlay.insert(definition.id.clone(), definition);
        Ok(())
    }

    fn check_tier_shape(definition: &TypeDefinition) -> TaxonResult<()> {
        let universal_id = is_universal_id(&definition.id);
        if universal_id != (definition.tier == Tier::Universal) {
            return Err(TaxonError::Consistency(format!(
                "type {} has tier {:?}; only the three universal ids are Universal",
                definition.id, definition.tier
            )));
        }
        if universal_id {
            if definition.extends.is_some() {
                return Err(TaxonError::Consistency(format!(
                    "universal type {} cannot extend another type",
                    definition.id
                )));
            }
            if definition.status != TypeStatus::Active {
                return Err(TaxonError::Consistency(format!(
                    "universal type {} must stay active, got {:?}",
                    definition.id, definition.status
                )));
            }
        } else if definition.extends.is_none() {
            return Err(TaxonError::Consistency(format!(
                "type {} must extend another type",
                definition.id
            )));
        }
        if definition.aliases.is_empty() {
            return Err(TaxonError::Consistency(format!(
                "type {} has no display name",
                definition.id
            )));
        }
        Ok(())
    }

    /// Whole-registry invariants: the three Universal identities exist, and
    /// every live type chains to one of them.
    pub fn validate(&self) -> TaxonResult<()> {
        for id in UNIVERSAL_TYPE_IDS {
            let id = TypeDefId::from_string(id);
            let definition = self.get(&id).ok_or_else(|| {
                TaxonError::Consistency(format!("universal type {id} is missing"))
            })?;
            Self::check_tier_shape(definition)?;
        }
        for definition in self.live_definitions() {
            Self::check_tier_shape(definition)?;
            self.chain(&definition.id)?;
        }
        Ok(())
    }
}
