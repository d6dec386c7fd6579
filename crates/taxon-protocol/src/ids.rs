//! Canonical ID types for the taxonomy engine.
//!
//! IDs are opaque String wrappers (serde-transparent). Generated IDs use
//! UUID v4; type identities are human-readable slugs so the three Universal
//! types keep stable, well-known ids across projects.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Isolation scope: every registry, unit store and ledger belongs to one project.
    ProjectId
);
typed_id!(
    /// Unique identifier for a knowledge unit.
    UnitId
);
typed_id!(
    /// Identity of a type definition. Stable across aliases.
    TypeDefId
);
typed_id!(
    /// Unique identifier for a friction event.
    FrictionId
);
typed_id!(
    /// Unique identifier for a type operation.
    OperationId
);
typed_id!(
    /// Unique identifier for a migration record.
    MigrationId
);
typed_id!(
    /// Unique identifier for a genesis (provenance) record.
    GenesisId
);
typed_id!(
    /// Reference to a promotion evaluation.
    EvaluationId
);
typed_id!(
    /// Identifier of one alternative inside a pending decision.
    AlternativeId
);
typed_id!(
    /// Unique identifier for a ledger entry.
    EntryId
);

impl TypeDefId {
    /// Derive a type id from a display name: lowercase, `_`-separated.
    pub fn slug(name: &str) -> Self {
        let mut out = String::with_capacity(name.len());
        let mut last_sep = true;
        for ch in name.chars() {
            if ch.is_alphanumeric() {
                out.extend(ch.to_lowercase());
                last_sep = false;
            } else if !last_sep {
                out.push('_');
                last_sep = true;
            }
        }
        while out.ends_with('_') {
            out.pop();
        }
        Self(out)
    }
}

impl AlternativeId {
    /// The status-quo alternative present on every pending decision.
    pub fn status_quo() -> Self {
        Self("status_quo".to_owned())
    }

    /// The alternative that applies the proposed operation as-is.
    pub fn proposed() -> Self {
        Self("proposed".to_owned())
    }
}

/// Content-addressed snapshot reference (SHA-256 hex string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotRef(String);

impl SnapshotRef {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic sequence number within a project ledger.
pub type SeqNo = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_id_new_is_unique() {
        let a = UnitId::new_uuid();
        let b = UnitId::new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn project_id_from_string() {
        let id = ProjectId::from_string("research");
        assert_eq!(id.as_str(), "research");
        assert_eq!(id.to_string(), "research");
    }

    #[test]
    fn type_slug_normalizes_display_names() {
        assert_eq!(TypeDefId::slug("Market Force").as_str(), "market_force");
        assert_eq!(TypeDefId::slug("  Macro/Event  ").as_str(), "macro_event");
        assert_eq!(TypeDefId::slug("MarketForce").as_str(), "marketforce");
    }

    #[test]
    fn typed_id_serializes_transparently() {
        let id = OperationId::from_string("OP001");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"OP001\"");
        let back: OperationId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn well_known_alternatives() {
        assert_eq!(AlternativeId::status_quo().as_str(), "status_quo");
        assert_ne!(AlternativeId::status_quo(), AlternativeId::proposed());
    }
}
