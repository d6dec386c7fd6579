use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use taxon_policy::RoutingPolicy;
use taxon_protocol::{OperationKind, TaxonResult};

/// Bounds on what the aggregator puts in front of the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceLimits {
    pub samples_per_type: usize,
    pub excerpt_chars: usize,
    /// Units per type considered for cluster separability.
    pub separability_units: usize,
}

impl Default for EvidenceLimits {
    fn default() -> Self {
        Self {
            samples_per_type: 5,
            excerpt_chars: 280,
            separability_units: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub root: PathBuf,
    pub evidence: EvidenceLimits,
    pub routing: RoutingPolicy,
    /// Capacity of the ledger broadcast channel.
    pub stream_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(".taxon")
    }
}

impl RuntimeConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            evidence: EvidenceLimits::default(),
            routing: RoutingPolicy::default(),
            stream_buffer: 1024,
        }
    }

    /// Parse a JSON override document. Missing keys keep their defaults.
    pub fn from_json(raw: &str) -> TaxonResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.routing.validate()?;
        Ok(config)
    }

    pub fn with_evidence_limits(mut self, limits: EvidenceLimits) -> Self {
        self.evidence = limits;
        self
    }

    pub fn with_high_impact_fraction(mut self, fraction: f64) -> Self {
        self.routing = self.routing.with_high_impact_fraction(fraction);
        self
    }

    pub fn with_auto_apply_kinds(mut self, kinds: Vec<OperationKind>) -> Self {
        self.routing = self.routing.with_auto_apply_kinds(kinds);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RuntimeConfig::from_json(
            r#"{ "root": "/tmp/taxon", "evidence": { "samples_per_type": 2 } }"#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/taxon"));
        assert_eq!(config.evidence.samples_per_type, 2);
        assert_eq!(config.evidence.excerpt_chars, 280);
        assert_eq!(config.routing, RoutingPolicy::default());
    }

    #[test]
    fn out_of_range_impact_fraction_is_rejected() {
        let err = RuntimeConfig::from_json(r#"{ "routing": { "high_impact_fraction": 4.0 } }"#)
            .unwrap_err();
        assert!(matches!(err, taxon_protocol::TaxonError::Validation(_)));
        let config =
            RuntimeConfig::from_json(r#"{ "routing": { "high_impact_fraction": 1.0 } }"#).unwrap();
        assert_eq!(config.routing.high_impact_fraction, 1.0);
    }

    #[test]
    fn builders_adjust_routing() {
        let config = RuntimeConfig::new("/tmp/x")
            .with_high_impact_fraction(0.5)
            .with_auto_apply_kinds(vec![OperationKind::Rename]);
        assert_eq!(config.routing.high_impact_fraction, 0.5);
        assert_eq!(config.routing.auto_apply_kinds, vec![OperationKind::Rename]);
    }
}
