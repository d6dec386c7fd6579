//! Error types for the taxonomy engine.

use thiserror::Error;

/// Errors that can occur in engine operations.
///
/// The first four variants are the engine's failure taxonomy; callers branch
/// on them (retry, abort, re-diagnose, skip cycle). The rest are plumbing.
#[derive(Debug, Error)]
pub enum TaxonError {
    /// Malformed oracle reply or missing evidence. The source record stays in
    /// its prior state and may be retried.
    #[error("validation error: {0}")]
    Validation(String),
    /// An invariant would be violated. Fatal to the operation.
    #[error("consistency error: {0}")]
    Consistency(String),
    /// Registry version moved underneath the operation.
    #[error("migration conflict: expected registry version {expected}, found {actual}")]
    MigrationConflict { expected: u64, actual: u64 },
    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TaxonError {
    /// Errors that leave state untouched and are worth retrying next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::MigrationConflict { .. } | Self::OracleUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for TaxonError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for engine operations.
pub type TaxonResult<T> = Result<T, TaxonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_both_versions() {
        let err = TaxonError::MigrationConflict {
            expected: 3,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "migration conflict: expected registry version 3, found 5"
        );
    }

    #[test]
    fn consistency_errors_are_not_retryable() {
        assert!(!TaxonError::Consistency("orphan".into()).is_retryable());
        assert!(TaxonError::OracleUnavailable("down".into()).is_retryable());
        assert!(TaxonError::Validation("bad reply".into()).is_retryable());
    }
}
