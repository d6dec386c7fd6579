//! Type taxonomy: tiers, type definitions and field specs.
//!
//! Three Universal identities anchor every chain. Domain and Emergent types
//! extend them (directly or through one Domain parent).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{GenesisId, TypeDefId};

pub const CONCEPT: &str = "concept";
pub const TENSION: &str = "tension";
pub const AGENT: &str = "agent";

/// The three Universal type ids, in canonical order.
pub const UNIVERSAL_TYPE_IDS: [&str; 3] = [CONCEPT, TENSION, AGENT];

/// Maximum number of `extends` hops from any type to its Universal root.
pub const MAX_EXTENDS_HOPS: usize = 2;

pub fn is_universal_id(id: &TypeDefId) -> bool {
    UNIVERSAL_TYPE_IDS.contains(&id.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Universal,
    Domain,
    Emergent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TypeStatus {
    Active,
    Hidden,
    MergedInto { target: TypeDefId },
    Deprecated,
}

impl TypeStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Hidden)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    LongText,
    List,
    Reference,
    Number,
    Flag,
}

/// Where a field first came from. Survives merges so the union schema keeps
/// per-field provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOrigin {
    pub type_id: TypeDefId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_id: Option<GenesisId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// Usage-tracking field maintained while a type is Emergent.
    #[serde(default)]
    pub tracking: bool,
    /// Kept as history only; no longer written.
    #[serde(default)]
    pub inert: bool,
    pub origin: FieldOrigin,
    /// Types whose identically named field was folded into this one by a merge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributed_by: Vec<TypeDefId>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind, origin: &TypeDefId) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            tracking: false,
            inert: false,
            origin: FieldOrigin {
                type_id: origin.clone(),
                genesis_id: None,
            },
            contributed_by: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn tracking(mut self) -> Self {
        self.tracking = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub id: TypeDefId,
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<TypeDefId>,
    /// Ordered; the last entry is the current display name.
    pub aliases: Vec<String>,
    pub schema: Vec<FieldSpec>,
    /// Schema revision; bumps whenever `schema` changes.
    pub revision: u32,
    #[serde(default)]
    pub frozen: bool,
    pub status: TypeStatus,
    /// Registry version at which this definition last changed.
    #[serde(default)]
    pub last_modified_at_version: u64,
    /// Genesis of a type created inside a project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_id: Option<GenesisId>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

pub(crate) fn default_schema_version() -> u8 {
    1
}

impl TypeDefinition {
    pub fn new(
        id: TypeDefId,
        tier: Tier,
        extends: Option<TypeDefId>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            tier,
            extends,
            aliases: vec![display_name.into()],
            schema: Vec::new(),
            revision: 1,
            frozen: false,
            status: TypeStatus::Active,
            last_modified_at_version: 0,
            genesis_id: None,
            created_at: Utc::now(),
            schema_version: default_schema_version(),
        }
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.schema.push(field);
        self
    }

    /// Current display name (last alias).
    pub fn display_name(&self) -> &str {
        self.aliases
            .last()
            .map(String::as_str)
            .unwrap_or(self.id.as_str())
    }

    pub fn is_universal(&self) -> bool {
        self.tier == Tier::Universal
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.schema.iter().find(|field| field.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.schema.iter().map(|field| field.name.as_str())
    }

    /// The three Universal definitions with their seed aliases.
    pub fn universal_seed() -> Vec<TypeDefinition> {
        let concept = TypeDefId::from_string(CONCEPT);
        let tension = TypeDefId::from_string(TENSION);
        let agent = TypeDefId::from_string(AGENT);
        vec![
            TypeDefinition::new(concept.clone(), Tier::Universal, None, "Concept")
                .with_field(FieldSpec::new("name", FieldKind::Text, &concept).required())
                .with_field(FieldSpec::new("definition", FieldKind::LongText, &concept)),
            TypeDefinition::new(tension.clone(), Tier::Universal, None, "Dialectic")
                .with_field(FieldSpec::new("name", FieldKind::Text, &tension).required())
                .with_field(FieldSpec::new("pole_a", FieldKind::Text, &tension))
                .with_field(FieldSpec::new("pole_b", FieldKind::Text, &tension)),
            TypeDefinition::new(agent.clone(), Tier::Universal, None, "Agent")
                .with_field(FieldSpec::new("name", FieldKind::Text, &agent).required())
                .with_field(FieldSpec::new("goals", FieldKind::List, &agent)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universal_seed_has_three_roots() {
        let seed = TypeDefinition::universal_seed();
        assert_eq!(seed.len(), 3);
        assert!(seed.iter().all(|ty| ty.is_universal() && ty.extends.is_none()));
        assert!(seed.iter().all(|ty| is_universal_id(&ty.id)));
    }

    #[test]
    fn display_name_is_last_alias() {
        let mut ty = TypeDefinition::new(
            TypeDefId::from_string("market_force"),
            Tier::Domain,
            Some(TypeDefId::from_string(CONCEPT)),
            "Market Force",
        );
        assert_eq!(ty.display_name(), "Market Force");
        ty.aliases.push("Market Driver".into());
        assert_eq!(ty.display_name(), "Market Driver");
    }

    #[test]
    fn merged_status_is_not_live() {
        let status = TypeStatus::MergedInto {
            target: TypeDefId::from_string("x"),
        };
        assert!(!status.is_live());
        assert!(TypeStatus::Hidden.is_live());
    }

    #[test]
    fn type_status_serializes_with_state_tag() {
        let json = serde_json::to_string(&TypeStatus::MergedInto {
            target: TypeDefId::from_string("c"),
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"merged_into","target":"c"}"#);
    }
}
