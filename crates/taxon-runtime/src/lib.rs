//! # taxon-runtime: the engine's working parts
//!
//! Mechanical evidence, oracle-backed friction detection and diagnosis,
//! transactional migrations and the generative pipeline. Everything here
//! works on a [`taxon_registry::ProjectState`] handed in by the caller and
//! returns typed [`taxon_protocol::TaxonError`]s; persistence and
//! serialization of writers live in the kernel.

pub mod config;
pub mod detector;
pub mod diagnoser;
pub mod evidence;
pub mod executor;
pub mod pipeline;
pub mod promotion;

#[cfg(test)]
mod fixtures;

pub use config::{EvidenceLimits, RuntimeConfig};
pub use detector::{DetectionReport, FrictionDetector};
pub use diagnoser::{Diagnoser, Materialized, materialize};
pub use evidence::{EvidenceAggregator, Similarity, TokenJaccard, two_seed_partition};
pub use executor::{AppliedMigration, Effects, MigrationExecutor, transform};
pub use pipeline::{GenerativePipeline, advance};
pub use promotion::{PromotionEvaluator, PromotionLedger, subject_key, type_entry};
