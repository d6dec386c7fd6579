//! Genesis records: immutable provenance entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{GenesisId, ProjectId};
use crate::taxonomy::default_schema_version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenesisTarget {
    Unit,
    Type,
    Field,
    Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePool {
    Seed,
    ExternalEvidence,
    Derived,
}

impl SourcePool {
    /// Pools a derivation chain may terminate in.
    pub fn is_root(self) -> bool {
        matches!(self, Self::Seed | Self::ExternalEvidence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisRecord {
    pub id: GenesisId,
    pub project_id: ProjectId,
    pub target_type: GenesisTarget,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_field: Option<String>,
    pub source_pool: SourcePool,
    #[serde(default)]
    pub derived_from: Vec<GenesisId>,
    #[serde(default)]
    pub needs_verification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<String>,
    #[serde(default)]
    pub note: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

impl GenesisRecord {
    /// Root record originating from seed material or external evidence.
    pub fn root(
        project_id: ProjectId,
        target_type: GenesisTarget,
        target_id: impl Into<String>,
        source_pool: SourcePool,
    ) -> Self {
        Self {
            id: GenesisId::default(),
            project_id,
            target_type,
            target_id: target_id.into(),
            target_field: None,
            source_pool,
            derived_from: Vec::new(),
            needs_verification: source_pool == SourcePool::ExternalEvidence,
            verified_by: None,
            note: String::new(),
            created_at: Utc::now(),
            schema_version: default_schema_version(),
        }
    }

    /// Record derived from one or more earlier records.
    pub fn derived(
        project_id: ProjectId,
        target_type: GenesisTarget,
        target_id: impl Into<String>,
        derived_from: Vec<GenesisId>,
    ) -> Self {
        Self {
            source_pool: SourcePool::Derived,
            derived_from,
            needs_verification: false,
            ..Self::root(project_id, target_type, target_id, SourcePool::Derived)
        }
    }

    pub fn for_field(mut self, field: impl Into<String>) -> Self {
        self.target_field = Some(field.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_evidence_needs_verification() {
        let record = GenesisRecord::root(
            ProjectId::from_string("p"),
            GenesisTarget::Unit,
            "u1",
            SourcePool::ExternalEvidence,
        );
        assert!(record.needs_verification);
        assert!(record.derived_from.is_empty());
    }

    #[test]
    fn derived_record_points_back() {
        let root = GenesisRecord::root(
            ProjectId::from_string("p"),
            GenesisTarget::Unit,
            "u1",
            SourcePool::Seed,
        );
        let derived = GenesisRecord::derived(
            ProjectId::from_string("p"),
            GenesisTarget::Field,
            "u1",
            vec![root.id.clone()],
        )
        .for_field("definition");
        assert_eq!(derived.source_pool, SourcePool::Derived);
        assert_eq!(derived.derived_from, vec![root.id]);
        assert_eq!(derived.target_field.as_deref(), Some("definition"));
        assert!(!SourcePool::Derived.is_root());
    }
}
