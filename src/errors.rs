//! Typed error hierarchy for the visage pipeline.
//!
//! Four top-level enums cover the four subsystems:
//! - `StoreError` — persistence failures, always surfaced to callers
//! - `GenerationError` — generative-AI collaborator failures
//! - `FetchError` — shopping-search collaborator failures
//! - `PipelineError` — phase orchestration failures
//!
//! A legitimate empty result is `Ok(None)`, never an error variant.

use std::time::Duration;

use thiserror::Error;

use crate::models::Phase;

/// Errors from the persistent store. The store never retries internally;
/// callers decide retry policy.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: std::path::PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database task panicked")]
    TaskPanicked,
}

/// Errors from the generative-AI collaborator.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generator API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Generator request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Generator timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generator returned an empty response")]
    Empty,

    #[error("Generator output is not parsable: {0}")]
    Parse(String),
}

/// Errors from the shopping-search collaborator.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Search API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Search request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Search timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed search response: {0}")]
    Malformed(String),
}

/// Errors from product resolution, which touches both the store and the
/// search collaborator.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Errors from the phase orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Phase '{missing}' must complete before '{requested}' can run")]
    PreconditionFailed { requested: Phase, missing: Phase },

    #[error("Budget {0:?} is not a parsable dollar amount")]
    InvalidBudget(String),

    #[error("Budget allocation percentages sum to {sum}, expected 100")]
    InvalidAllocation { sum: f64 },

    #[error("Budget allocation names category {0:?} outside the allowed set")]
    UnknownCategory(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_failed_names_missing_phase() {
        let err = PipelineError::PreconditionFailed {
            requested: Phase::Recommendation,
            missing: Phase::Analysis,
        };
        let msg = err.to_string();
        assert!(msg.contains("analysis"));
        assert!(msg.contains("recommendation"));
    }

    #[test]
    fn generation_parse_is_matchable() {
        let err = GenerationError::Parse("trailing garbage".into());
        assert!(matches!(err, GenerationError::Parse(_)));
    }

    #[test]
    fn resolve_error_converts_from_both_sources() {
        let store: ResolveError = StoreError::LockPoisoned.into();
        assert!(matches!(store, ResolveError::Store(_)));

        let fetch: ResolveError = FetchError::Malformed("no body".into()).into();
        assert!(matches!(fetch, ResolveError::Fetch(_)));
    }

    #[test]
    fn pipeline_error_converts_from_store_error() {
        let err: PipelineError = StoreError::LockPoisoned.into();
        assert!(matches!(err, PipelineError::Store(StoreError::LockPoisoned)));
    }

    #[test]
    fn invalid_allocation_carries_sum() {
        let err = PipelineError::InvalidAllocation { sum: 97.0 };
        assert!(err.to_string().contains("97"));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&GenerationError::Empty);
        assert_std_error(&FetchError::Timeout(Duration::from_secs(10)));
        assert_std_error(&PipelineError::InvalidBudget("abc".into()));
    }
}
