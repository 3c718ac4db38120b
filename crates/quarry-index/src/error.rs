//! Error taxonomy for the indexing core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the indexing core.
///
/// Only `ProviderUnavailable` and `Configuration` are fatal, and only at
/// initialization. `DimensionMismatch` is fatal for the batch that produced
/// it and lands in the failed-batch ledger. `StaleLockDetected` and
/// `CorruptSnapshot` are recovered on the spot and logged.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no usable embedding provider: {0}")]
    ProviderUnavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("stale pass lock at {path:?}: a previous indexing pass did not complete")]
    StaleLockDetected { path: PathBuf },

    #[error("corrupt snapshot at {path:?}: discarding and starting empty")]
    CorruptSnapshot { path: PathBuf },
}
