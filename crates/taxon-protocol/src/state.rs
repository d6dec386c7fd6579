//! Persisted project state: the (TypeRegistry, UnitStore) pair under one
//! version counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::{ProjectId, SnapshotRef, TypeDefId};
use crate::taxonomy::{FieldSpec, TypeDefinition, default_schema_version};
use crate::unit::Unit;

/// Superseded schema of a type, kept so units written against it can be
/// upgraded lazily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRevision {
    pub type_id: TypeDefId,
    pub revision: u32,
    pub schema: Vec<FieldSpec>,
}

/// Versioned snapshot of one project. `types` holds the project's overlay
/// only; `inherited` names the doctrine definitions it reads through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project_id: ProjectId,
    pub version: u64,
    #[serde(default)]
    pub inherited: Vec<TypeDefId>,
    #[serde(default)]
    pub types: Vec<TypeDefinition>,
    #[serde(default)]
    pub schema_history: Vec<SchemaRevision>,
    #[serde(default)]
    pub units: Vec<Unit>,
    pub saved_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

impl ProjectSnapshot {
    pub fn empty(project_id: ProjectId) -> Self {
        Self {
            project_id,
            version: 0,
            inherited: Vec::new(),
            types: Vec::new(),
            schema_history: Vec::new(),
            units: Vec::new(),
            saved_at: Utc::now(),
            schema_version: default_schema_version(),
        }
    }

    /// Content address of the snapshot, excluding the save time.
    pub fn content_ref(&self) -> SnapshotRef {
        let mut hasher = Sha256::new();
        hasher.update(self.project_id.as_str().as_bytes());
        hasher.update(self.version.to_le_bytes());
        for part in [
            serde_json::to_vec(&self.inherited),
            serde_json::to_vec(&self.types),
            serde_json::to_vec(&self.schema_history),
            serde_json::to_vec(&self.units),
        ] {
            hasher.update(part.unwrap_or_default());
        }
        SnapshotRef::from_hex(hex::encode(hasher.finalize()))
    }
}
