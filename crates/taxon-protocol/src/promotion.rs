//! Test battery results, abstractions and promotion ledger entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EvaluationId, TypeDefId, UnitId};
use crate::taxonomy::default_schema_version;

/// The fixed test battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestDimension {
    Consistency,
    EdgeCaseCoverage,
    Usefulness,
}

impl TestDimension {
    pub const BATTERY: [TestDimension; 3] =
        [Self::Consistency, Self::EdgeCaseCoverage, Self::Usefulness];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    Pass,
    Fail,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionResult {
    pub dimension: TestDimension,
    pub verdict: TestVerdict,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub unit_id: UnitId,
    pub unit_version: u32,
    pub results: Vec<DimensionResult>,
    pub tested_at: DateTime<Utc>,
}

impl TestResult {
    /// Every battery dimension present and passing.
    pub fn passed(&self) -> bool {
        TestDimension::BATTERY.iter().all(|dimension| {
            self.results
                .iter()
                .any(|r| r.dimension == *dimension && r.verdict == TestVerdict::Pass)
        })
    }

    pub fn unresolved(&self) -> Vec<TestDimension> {
        TestDimension::BATTERY
            .iter()
            .copied()
            .filter(|dimension| {
                !self
                    .results
                    .iter()
                    .any(|r| r.dimension == *dimension && r.verdict != TestVerdict::Unresolved)
            })
            .collect()
    }
}

/// Condition under which a unit is expected to carry over to another project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCondition {
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abstraction {
    pub unit_id: UnitId,
    pub unit_version: u32,
    pub summary: String,
    pub transfer_conditions: Vec<TransferCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum PromotionSubject {
    Unit { unit_id: UnitId, version: u32 },
    Type { type_id: TypeDefId, revision: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionEntry {
    pub subject: PromotionSubject,
    pub promoted_at: DateTime<Utc>,
    pub evaluation_ref: EvaluationId,
    /// Short label used for duplicate screening.
    pub label: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub transfer_conditions: Vec<TransferCondition>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemotionEntry {
    pub subject: PromotionSubject,
    pub demoted_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PromotionDecision {
    Approved {
        entry: PromotionEntry,
    },
    Rejected {
        reasons: Vec<String>,
    },
    /// Near-duplicate of something already promoted; needs a merge decision.
    FlagForMerge {
        duplicate_of: Vec<PromotionSubject>,
        rationale: String,
    },
}
