//! Knowledge units and their lifecycle stages.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{GenesisId, ProjectId, TypeDefId, UnitId};
use crate::taxonomy::default_schema_version;

/// Display field holding a user's free-text type name when the assigned type
/// did not fit.
pub const TYPE_OVERRIDE_FIELD: &str = "type_override";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Draft,
    Tested,
    Promoted,
    Deprecated,
}

/// Generative pipeline stage. `status` is the coarse projection of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Draft,
    Coined,
    Tested,
    Abstracted,
    Promoted,
    Deprecated,
}

impl PipelineStage {
    pub fn status(self) -> UnitStatus {
        match self {
            Self::Draft | Self::Coined => UnitStatus::Draft,
            Self::Tested | Self::Abstracted => UnitStatus::Tested,
            Self::Promoted => UnitStatus::Promoted,
            Self::Deprecated => UnitStatus::Deprecated,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Promoted | Self::Deprecated)
    }

    /// Legal forward transitions of the pipeline state machine.
    pub fn can_advance_to(self, next: PipelineStage) -> bool {
        match (self, next) {
            (Self::Draft, Self::Coined) => true,
            (Self::Coined, Self::Tested) => true,
            // revision loop
            (Self::Tested, Self::Coined) => true,
            (Self::Abstracted, Self::Coined) => true,
            (Self::Tested, Self::Abstracted) => true,
            (Self::Abstracted, Self::Promoted) => true,
            (from, Self::Deprecated) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub project_id: ProjectId,
    pub type_id: TypeDefId,
    /// Schema revision of `type_id` this unit was written against.
    pub type_revision: u32,
    pub domain: String,
    pub display_fields: IndexMap<String, Value>,
    pub status: UnitStatus,
    pub stage: PipelineStage,
    pub version: u32,
    pub genesis_id: GenesisId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

impl Unit {
    pub fn new(
        project_id: ProjectId,
        type_id: TypeDefId,
        type_revision: u32,
        domain: impl Into<String>,
        genesis_id: GenesisId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: UnitId::default(),
            project_id,
            type_id,
            type_revision,
            domain: domain.into(),
            display_fields: IndexMap::new(),
            status: UnitStatus::Draft,
            stage: PipelineStage::Draft,
            version: 1,
            genesis_id,
            created_at: now,
            updated_at: now,
            schema_version: default_schema_version(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.display_fields.insert(name.into(), value.into());
        self
    }

    /// Move to a new pipeline stage, keeping `status` in sync.
    pub fn set_stage(&mut self, stage: PipelineStage) {
        self.stage = stage;
        self.status = stage.status();
        self.updated_at = Utc::now();
    }

    /// Record a structural edit.
    pub fn bump_version(&mut self) {
        self.version = self.version.saturating_add(1);
        self.updated_at = Utc::now();
    }

    pub fn type_override(&self) -> Option<&str> {
        self.display_fields
            .get(TYPE_OVERRIDE_FIELD)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Concatenated textual content, used by similarity primitives.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.display_fields {
            if name == TYPE_OVERRIDE_FIELD {
                continue;
            }
            match value {
                Value::String(text) => {
                    out.push_str(text);
                    out.push(' ');
                }
                Value::Array(items) => {
                    for item in items.iter().filter_map(Value::as_str) {
                        out.push_str(item);
                        out.push(' ');
                    }
                }
                _ => {}
            }
        }
        out.trim_end().to_owned()
    }

    /// Short human-readable label: the `name` field, else the id.
    pub fn label(&self) -> String {
        self.display_fields
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| self.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> Unit {
        Unit::new(
            ProjectId::from_string("p"),
            TypeDefId::from_string("concept"),
            1,
            "finance",
            GenesisId::from_string("g1"),
        )
    }

    #[test]
    fn new_unit_is_draft_version_one() {
        let unit = unit();
        assert_eq!(unit.status, UnitStatus::Draft);
        assert_eq!(unit.stage, PipelineStage::Draft);
        assert_eq!(unit.version, 1);
    }

    #[test]
    fn stage_transitions_follow_pipeline() {
        use PipelineStage::*;
        assert!(Draft.can_advance_to(Coined));
        assert!(Tested.can_advance_to(Coined));
        assert!(Coined.can_advance_to(Deprecated));
        assert!(!Draft.can_advance_to(Tested));
        assert!(!Promoted.can_advance_to(Deprecated));
        assert!(!Deprecated.can_advance_to(Coined));
    }

    #[test]
    fn set_stage_projects_status() {
        let mut unit = unit();
        unit.set_stage(PipelineStage::Abstracted);
        assert_eq!(unit.status, UnitStatus::Tested);
    }

    #[test]
    fn text_content_skips_override_field() {
        let unit = unit()
            .with_field("name", "Rate hike")
            .with_field(TYPE_OVERRIDE_FIELD, "Macro shock")
            .with_field("tags", serde_json::json!(["fed", "rates"]));
        assert_eq!(unit.text_content(), "Rate hike fed rates");
        assert_eq!(unit.type_override(), Some("Macro shock"));
        assert_eq!(unit.label(), "Rate hike");
    }
}
