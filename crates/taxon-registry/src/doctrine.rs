//! Shared doctrine base.
//!
//! Project registries read through a frozen view of the doctrine and write to
//! their own overlay. Publishing swaps in a new view; registries that already
//! hold the old one are unaffected.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use taxon_protocol::{TaxonError, TaxonResult, Tier, TypeDefId, TypeDefinition, TypeStatus};
use tracing::{debug, info};

pub type DoctrineView = Arc<IndexMap<TypeDefId, TypeDefinition>>;

#[derive(Debug)]
pub struct DoctrineBase {
    view: RwLock<DoctrineView>,
    retracted: RwLock<BTreeSet<TypeDefId>>,
}

impl Default for DoctrineBase {
    fn default() -> Self {
        Self::with_universal_seed()
    }
}

impl DoctrineBase {
    /// Doctrine holding only the three Universal types.
    pub fn with_universal_seed() -> Self {
        let seed = TypeDefinition::universal_seed()
            .into_iter()
            .map(|definition| (definition.id.clone(), definition))
            .collect();
        Self {
            view: RwLock::new(Arc::new(seed)),
            retracted: RwLock::new(BTreeSet::new()),
        }
    }

    /// Current frozen view. Every definition ever published stays resolvable
    /// here, including retracted ones.
    pub fn view(&self) -> DoctrineView {
        self.view.read().clone()
    }

    pub fn get(&self, id: &TypeDefId) -> Option<TypeDefinition> {
        self.view.read().get(id).cloned()
    }

    /// Ids a newly created project inherits.
    pub fn inheritable_ids(&self) -> Vec<TypeDefId> {
        let retracted = self.retracted.read();
        self.view
            .read()
            .keys()
            .filter(|id| !retracted.contains(*id))
            .cloned()
            .collect()
    }

    pub fn is_retracted(&self, id: &TypeDefId) -> bool {
        self.retracted.read().contains(id)
    }

    /// Publish a promoted Domain type. Re-publishing an equal or older
    /// revision is a no-op; the Universal types are never replaced.
    pub fn publish(&self, definition: TypeDefinition) -> TaxonResult<bool> {
        if definition.tier != Tier::Domain {
            return Err(TaxonError::Consistency(format!(
                "only Domain types can enter doctrine, {} is {:?}",
                definition.id, definition.tier
            )));
        }
        if definition.status != TypeStatus::Active {
            return Err(TaxonError::Consistency(format!(
                "type {} is not active",
                definition.id
            )));
        }
        if let Some(parent) = &definition.extends
            && self.get(parent).is_none()
        {
            return Err(TaxonError::Consistency(format!(
                "doctrine type {} extends {parent}, which is not in doctrine",
                definition.id
            )));
        }

        let mut guard = self.view.write();
        if let Some(existing) = guard.get(&definition.id)
            && existing.revision >= definition.revision
        {
            debug!(type_id = %definition.id, "doctrine already holds this revision");
            self.retracted.write().remove(&definition.id);
            return Ok(false);
        }
        let mut next = IndexMap::clone(&guard);
        info!(type_id = %definition.id, revision = definition.revision, "type published to doctrine");
        next.insert(definition.id.clone(), definition.clone());
        *guard = Arc::new(next);
        self.retracted.write().remove(&definition.id);
        Ok(true)
    }

    /// Stop handing a type to new projects. Existing projects keep it.
    pub fn retract(&self, id: &TypeDefId) -> TaxonResult<()> {
        if taxon_protocol::is_universal_id(id) {
            return Err(TaxonError::Consistency(format!(
                "universal type {id} cannot leave doctrine"
            )));
        }
        if self.get(id).is_none() {
            return Err(TaxonError::NotFound(format!("doctrine type {id}")));
        }
        self.retracted.write().insert(id.clone());
        info!(type_id = %id, "type retracted from doctrine");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxon_protocol::CONCEPT;

    fn domain(name: &str) -> TypeDefinition {
        let mut definition = TypeDefinition::new(
            TypeDefId::slug(name),
            Tier::Domain,
            Some(TypeDefId::from_string(CONCEPT)),
            name,
        );
        definition.frozen = true;
        definition
    }

    #[test]
    fn seed_holds_three_universal_types() {
        let base = DoctrineBase::with_universal_seed();
        assert_eq!(base.inheritable_ids().len(), 3);
    }

    #[test]
    fn publish_swaps_view_without_touching_old_holders() {
        let base = DoctrineBase::with_universal_seed();
        let before = base.view();
        assert!(base.publish(domain("Market Force")).unwrap());
        assert_eq!(before.len(), 3);
        assert_eq!(base.view().len(), 4);
        assert!(!base.publish(domain("Market Force")).unwrap());
    }

    #[test]
    fn emergent_types_cannot_be_published() {
        let base = DoctrineBase::with_universal_seed();
        let mut definition = domain("Hunch");
        definition.tier = Tier::Emergent;
        assert!(matches!(
            base.publish(definition),
            Err(TaxonError::Consistency(_))
        ));
    }

    #[test]
    fn retracted_type_stays_resolvable_but_is_not_inherited() {
        let base = DoctrineBase::with_universal_seed();
        base.publish(domain("Market Force")).unwrap();
        let id = TypeDefId::slug("Market Force");
        base.retract(&id).unwrap();
        assert!(base.get(&id).is_some());
        assert!(!base.inheritable_ids().contains(&id));
        assert!(base.retract(&TypeDefId::from_string(CONCEPT)).is_err());
    }
}
