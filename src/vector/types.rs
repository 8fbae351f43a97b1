//! Newtypes and errors shared by the vector modules.

use thiserror::Error;

/// Number of a k-means partition, counted from zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode,
)]
pub struct PartitionId(u32);

impl PartitionId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// Position in the partition table.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Cosine similarity folded into `[0, 1]`.
///
/// Only [`Score::from_cosine`] builds one, so a score is never NaN and never
/// outside the unit interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score(f32);

impl Score {
    /// Negative similarities and NaN become 0, overshoot from rounding
    /// becomes 1.
    #[must_use]
    pub fn from_cosine(cosine: f32) -> Self {
        if cosine.is_nan() {
            Self(0.0)
        } else {
            Self(cosine.clamp(0.0, 1.0))
        }
    }

    #[must_use]
    pub fn get(&self) -> f32 {
        self.0
    }

    /// Whether this score passes a similarity threshold (inclusive).
    #[must_use]
    pub fn meets(&self, threshold: f32) -> bool {
        self.0 >= threshold
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Length of every vector an index or embedder works with. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct VectorDimension(usize);

impl VectorDimension {
    pub fn new(dimension: usize) -> Result<Self, VectorError> {
        if dimension == 0 {
            return Err(VectorError::ZeroDimension);
        }
        Ok(Self(dimension))
    }

    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Rejects vectors of any other length.
    pub fn check(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() == self.0 {
            Ok(())
        } else {
            Err(VectorError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            })
        }
    }
}

impl std::fmt::Display for VectorDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}d", self.0)
    }
}

/// Failures of the vector index, its checkpoints and the embedders.
#[derive(Error, Debug)]
pub enum VectorError {
    #[error(
        "vector has {actual} components, the index expects {expected}\nSuggestion: embedding.dimension must match the model in use"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector dimension must be greater than zero")]
    ZeroDimension,

    #[error("vector is all zeros or contains NaN/infinity\nSuggestion: check the embedding model output")]
    DegenerateVector,

    #[error("checkpoint I/O failed: {0}\nSuggestion: check disk space and permissions of the data directory")]
    Storage(#[from] std::io::Error),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("partitioning failed: {0}")]
    ClusteringFailed(String),

    #[error(
        "checkpoint payload unreadable: {0}\nSuggestion: delete the checkpoint; it is rebuilt from the record store"
    )]
    Serialization(String),

    #[error("not a vector checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error(
        "checkpoint format {actual} is not supported (expected {expected})\nSuggestion: delete the checkpoint; it is rebuilt from the record store"
    )]
    VersionMismatch { expected: u32, actual: u32 },
}
