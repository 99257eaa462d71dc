//! Error type for the memory layer.

use spatialvcs_types::SpatialError;
use thiserror::Error;

/// Failures raised by the embedder, the vector index, or store bookkeeping.
///
/// A store that never became ready does not surface these; it reports
/// [`StoreStatus::Degraded`][crate::store::StoreStatus::Degraded] instead.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("embedding has {got} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("invalid collection name {0:?}: use ASCII letters, digits and '_'")]
    InvalidCollection(String),
}

impl From<MemoryError> for SpatialError {
    fn from(e: MemoryError) -> Self {
        SpatialError::Memory(e.to_string())
    }
}
