//! Mechanical evidence gathered from a project. No judgment lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::{ProjectId, TypeDefId, UnitId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSample {
    pub unit_id: UnitId,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeUsage {
    pub type_id: TypeDefId,
    pub display_name: String,
    pub unit_count: usize,
    pub uncategorized_count: usize,
    pub samples: Vec<ContentSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Free-text type names users typed over an assigned type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeNameOverride {
    pub declared_type: TypeDefId,
    pub free_text: String,
    pub unit_ids: Vec<UnitId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOverlap {
    pub a: TypeDefId,
    pub b: TypeDefId,
    pub shared_fields: Vec<String>,
    /// |A ∩ B| / |A ∪ B| over field names.
    pub ratio: f64,
}

/// Two-way content partition of one type's units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSeparability {
    pub type_id: TypeDefId,
    pub clusters: Vec<Vec<UnitId>>,
    pub mean_within: f64,
    pub mean_between: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePackage {
    pub project_id: ProjectId,
    pub registry_version: u64,
    pub gathered_at: DateTime<Utc>,
    pub usage: Vec<TypeUsage>,
    pub overrides: Vec<TypeNameOverride>,
    pub field_overlaps: Vec<FieldOverlap>,
    pub separability: Vec<ClusterSeparability>,
    /// Notes about data that could not be gathered.
    #[serde(default)]
    pub gaps: Vec<String>,
}

impl EvidencePackage {
    pub fn is_partial(&self) -> bool {
        !self.gaps.is_empty()
    }

    pub fn usage_for(&self, type_id: &TypeDefId) -> Option<&TypeUsage> {
        self.usage.iter().find(|usage| &usage.type_id == type_id)
    }

    pub fn separability_for(&self, type_id: &TypeDefId) -> Option<&ClusterSeparability> {
        self.separability.iter().find(|s| &s.type_id == type_id)
    }

    pub fn overrides_for<'a>(
        &'a self,
        type_id: &'a TypeDefId,
    ) -> impl Iterator<Item = &'a TypeNameOverride> + 'a {
        self.overrides
            .iter()
            .filter(move |o| &o.declared_type == type_id)
    }

    pub fn overlaps_for<'a>(
        &'a self,
        type_id: &'a TypeDefId,
    ) -> impl Iterator<Item = &'a FieldOverlap> + 'a {
        self.field_overlaps
            .iter()
            .filter(move |o| &o.a == type_id || &o.b == type_id)
    }

    /// Stable digest over the package contents, excluding the gather time.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.project_id.as_str().as_bytes());
        hasher.update(self.registry_version.to_le_bytes());
        for part in [
            serde_json::to_vec(&self.usage),
            serde_json::to_vec(&self.overrides),
            serde_json::to_vec(&self.field_overlaps),
            serde_json::to_vec(&self.separability),
        ] {
            hasher.update(part.unwrap_or_default());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> EvidencePackage {
        EvidencePackage {
            project_id: ProjectId::from_string("p"),
            registry_version: 4,
            gathered_at: Utc::now(),
            usage: vec![],
            overrides: vec![],
            field_overlaps: vec![],
            separability: vec![],
            gaps: vec![],
        }
    }

    #[test]
    fn digest_ignores_gather_time() {
        let a = package();
        let mut b = package();
        b.gathered_at = a.gathered_at + chrono::Duration::seconds(30);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn digest_tracks_registry_version() {
        let a = package();
        let mut b = package();
        b.registry_version = 5;
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn gaps_mark_package_partial() {
        let mut p = package();
        assert!(!p.is_partial());
        p.gaps.push("no units".into());
        assert!(p.is_partial());
    }
}
