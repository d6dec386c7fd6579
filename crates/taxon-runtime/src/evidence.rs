//! Mechanical evidence gathering. Counts, samples, overlaps and cluster
//! shape; every qualitative reading is left to the oracle.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use taxon_protocol::{
    ClusterSeparability, ContentSample, EvidencePackage, FieldOverlap, TypeDefId, TypeDefinition,
    TypeNameOverride, TypeUsage, Unit, UnitId, is_universal_id,
};
use taxon_registry::ProjectState;
use tracing::{debug, instrument};

use crate::config::EvidenceLimits;

/// Pairwise content similarity in `[0, 1]`.
pub trait Similarity: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Jaccard index over lowercase word tokens of two or more characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenJaccard;

impl TokenJaccard {
    fn tokens(text: &str) -> BTreeSet<String> {
        text.split(|ch: char| !ch.is_alphanumeric())
            .filter(|token| token.chars().count() > 1)
            .map(str::to_lowercase)
            .collect()
    }
}

impl Similarity for TokenJaccard {
    fn score(&self, a: &str, b: &str) -> f64 {
        let a = Self::tokens(a);
        let b = Self::tokens(b);
        let union = a.union(&b).count();
        if union == 0 {
            return 0.0;
        }
        a.intersection(&b).count() as f64 / union as f64
    }
}

/// Split `items` in two around the least similar pair. Each remaining item
/// joins the seed it scores higher against; ties go to the first seed.
pub fn two_seed_partition(
    type_id: &TypeDefId,
    items: &[(UnitId, String)],
    similarity: &dyn Similarity,
) -> Option<ClusterSeparability> {
    let n = items.len();
    if n < 2 {
        return None;
    }
    let mut scores = vec![vec![1.0_f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let score = similarity.score(&items[i].1, &items[j].1);
            scores[i][j] = score;
            scores[j][i] = score;
        }
    }

    let (mut seed_a, mut seed_b) = (0, 1);
    for i in 0..n {
        for j in (i + 1)..n {
            if scores[i][j] < scores[seed_a][seed_b] {
                seed_a = i;
                seed_b = j;
            }
        }
    }

    let second: Vec<bool> = (0..n)
        .map(|k| {
            if k == seed_a {
                false
            } else if k == seed_b {
                true
            } else {
                scores[k][seed_b] > scores[k][seed_a]
            }
        })
        .collect();

    let (mut within_sum, mut within_pairs) = (0.0, 0_usize);
    let (mut between_sum, mut between_pairs) = (0.0, 0_usize);
    for i in 0..n {
        for j in (i + 1)..n {
            if second[i] == second[j] {
                within_sum += scores[i][j];
                within_pairs += 1;
            } else {
                between_sum += scores[i][j];
                between_pairs += 1;
            }
        }
    }

    let cluster = |want: bool| -> Vec<UnitId> {
        items
            .iter()
            .zip(&second)
            .filter(|(_, side)| **side == want)
            .map(|((id, _), _)| id.clone())
            .collect()
    };
    Some(ClusterSeparability {
        type_id: type_id.clone(),
        clusters: vec![cluster(false), cluster(true)],
        // singleton clusters are trivially coherent
        mean_within: if within_pairs == 0 {
            1.0
        } else {
            within_sum / within_pairs as f64
        },
        mean_between: if between_pairs == 0 {
            0.0
        } else {
            between_sum / between_pairs as f64
        },
    })
}

fn field_overlap(a: &TypeDefinition, b: &TypeDefinition) -> Option<FieldOverlap> {
    let names = |definition: &TypeDefinition| -> BTreeSet<String> {
        definition
            .schema
            .iter()
            .filter(|field| !field.inert)
            .map(|field| field.name.clone())
            .collect()
    };
    let left = names(a);
    let right = names(b);
    let shared: Vec<String> = left.intersection(&right).cloned().collect();
    if shared.is_empty() {
        return None;
    }
    let union = left.union(&right).count();
    Some(FieldOverlap {
        a: a.id.clone(),
        b: b.id.clone(),
        ratio: shared.len() as f64 / union as f64,
        shared_fields: shared,
    })
}

fn is_uncategorized(unit: &Unit) -> bool {
    is_universal_id(&unit.type_id) || unit.type_override().is_some()
}

#[derive(Clone)]
pub struct EvidenceAggregator {
    limits: EvidenceLimits,
    similarity: Arc<dyn Similarity>,
}

impl Default for EvidenceAggregator {
    fn default() -> Self {
        Self::new(EvidenceLimits::default())
    }
}

impl EvidenceAggregator {
    pub fn new(limits: EvidenceLimits) -> Self {
        Self {
            limits,
            similarity: Arc::new(TokenJaccard),
        }
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn Similarity>) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn limits(&self) -> &EvidenceLimits {
        &self.limits
    }

    fn excerpt(&self, unit: &Unit) -> String {
        unit.text_content()
            .chars()
            .take(self.limits.excerpt_chars)
            .collect()
    }

    fn usage_for(&self, definition: &TypeDefinition, state: &ProjectState) -> TypeUsage {
        let units = state.units.by_type(&definition.id);
        TypeUsage {
            type_id: definition.id.clone(),
            display_name: definition.display_name().to_owned(),
            unit_count: units.len(),
            uncategorized_count: units.iter().filter(|unit| is_uncategorized(unit)).count(),
            samples: units
                .iter()
                .take(self.limits.samples_per_type)
                .map(|unit| ContentSample {
                    unit_id: unit.id.clone(),
                    excerpt: self.excerpt(unit),
                })
                .collect(),
            last_activity: units.iter().map(|unit| unit.updated_at).max(),
        }
    }

    /// Collect the evidence package for one project state. Never fails;
    /// anything that cannot be measured is noted in `gaps`.
    #[instrument(skip(self, state), fields(project_id = %state.project_id, version = state.version))]
    pub fn gather(&self, state: &ProjectState) -> EvidencePackage {
        let mut gaps = Vec::new();
        if state.units.is_empty() {
            gaps.push("project has no units yet".to_owned());
        }
        let live = state.registry.live_definitions();

        let usage: Vec<TypeUsage> = live
            .iter()
            .map(|definition| self.usage_for(definition, state))
            .collect();

        let mut grouped: IndexMap<(TypeDefId, String), Vec<UnitId>> = IndexMap::new();
        for unit in state.units.all() {
            if let Some(text) = unit.type_override() {
                grouped
                    .entry((unit.type_id.clone(), text.trim().to_owned()))
                    .or_default()
                    .push(unit.id.clone());
            }
        }
        let overrides = grouped
            .into_iter()
            .map(|((declared_type, free_text), unit_ids)| TypeNameOverride {
                declared_type,
                free_text,
                unit_ids,
            })
            .collect();

        let mut field_overlaps = Vec::new();
        for (index, a) in live.iter().enumerate() {
            for b in &live[index + 1..] {
                field_overlaps.extend(field_overlap(a, b));
            }
        }

        let mut separability = Vec::new();
        for definition in &live {
            let units = state.units.by_type(&definition.id);
            if units.len() < 2 {
                continue;
            }
            if units.len() > self.limits.separability_units {
                gaps.push(format!(
                    "type {}: separability measured over the first {} of {} units",
                    definition.id,
                    self.limits.separability_units,
                    units.len()
                ));
            }
            let items: Vec<(UnitId, String)> = units
                .iter()
                .take(self.limits.separability_units)
                .map(|unit| (unit.id.clone(), unit.text_content()))
                .filter(|(_, text)| !text.trim().is_empty())
                .collect();
            match two_seed_partition(&definition.id, &items, self.similarity.as_ref()) {
                Some(measured) => separability.push(measured),
                None => gaps.push(format!(
                    "type {}: too few units with text content to measure separability",
                    definition.id
                )),
            }
        }

        let package = EvidencePackage {
            project_id: state.project_id.clone(),
            registry_version: state.version,
            gathered_at: Utc::now(),
            usage,
            overrides,
            field_overlaps,
            separability,
            gaps,
        };
        debug!(
            types = package.usage.len(),
            overrides = package.overrides.len(),
            gaps = package.gaps.len(),
            "evidence gathered"
        );
        package
    }
}
