use std::path::PathBuf;
use thiserror::Error;

/// Raised by the normalizer when a vector has no usable direction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DegenerateEmbedding {
    #[error("embedding is empty")]
    Empty,
    #[error("embedding has zero length")]
    ZeroNorm,
    #[error("embedding contains non-finite values")]
    NonFinite,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    #[error("embedding dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Why a query or enrollment embedding was turned away.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidEmbedding {
    #[error(transparent)]
    Degenerate(#[from] DegenerateEmbedding),
    #[error(transparent)]
    Dimension(#[from] IndexError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("position {position} is out of range for {len} stored labels")]
pub struct OutOfRange {
    pub position: usize,
    pub len: usize,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o on snapshot '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("encoding snapshot '{path}': {source}")]
    Encode {
        path: PathBuf,
        source: postcard::Error,
    },

    #[error("decoding snapshot '{path}': {source}")]
    Decode {
        path: PathBuf,
        source: postcard::Error,
    },

    #[error("snapshot '{path}' is corrupt: {reason}")]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("snapshot '{path}' holds {found}-dimensional embeddings, configured for {expected}")]
    DimensionMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

/// Faults that abort an engine operation. None of these are per-request
/// outcomes; they mean the gallery can no longer be trusted.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("gallery out of alignment: {vectors} embeddings but {labels} labels")]
    Misaligned { vectors: usize, labels: usize },

    #[error(transparent)]
    OutOfRange(#[from] OutOfRange),

    #[error("invalid query embedding: {0}")]
    InvalidQuery(#[from] InvalidEmbedding),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
