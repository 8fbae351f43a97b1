//! Vector search over record embeddings.
//!
//! # Architecture
//! The index holds one unit vector per record. Below a configured population
//! it scans everything; above it, k-means partitions the vectors and queries
//! probe only the nearest partitions (IVF-Flat). Deletions leave tombstones
//! that the next build drops. Checkpoints are lz4-compressed bincode behind a
//! small fixed header, read back through a memory map.

mod checkpoint;
mod clustering;
mod embedding;
mod index;
mod types;

pub use checkpoint::{CheckpointHeader, read_header};
pub use clustering::{
    ClusteringError, KMeansResult, assign_to_nearest_centroid, cosine_similarity, kmeans_clustering,
    partition_count,
};
pub use embedding::{
    Embedder, EmbeddingGenerator, FastEmbedGenerator, HashingEmbedder, TextKind,
    generator_from_config, models_dir,
};
pub use index::{VectorIndex, VectorIndexConfig, VectorIndexStats, VectorMode};
pub use types::{PartitionId, Score, VectorDimension, VectorError};
