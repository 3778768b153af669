//! Crate-wide error type.
//!
//! Mirrors the error kinds spelled out for the HTTP surface: a handler maps
//! each variant to a status code rather than collapsing everything to 500.

use thiserror::Error;

/// Error kinds produced anywhere in the ingestion/retrieval pipeline.
#[derive(Debug, Error)]
pub enum KbError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("provider busy: {0}")]
    ProviderBusy(String),

    #[error("provider returned malformed output: {0}")]
    ProviderMalformed(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Never surfaced to a caller — produced internally by similarity scans
    /// and filtered before the caller sees a result.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

pub type KbResult<T> = Result<T, KbError>;
