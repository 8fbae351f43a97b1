//! Geo-tagged location store with keyword, semantic-vector and radius search.
//!
//! The Record Store is the source of truth; the spatial, text and vector
//! indices are derived from it and reconciled against it. [`GeoTagEngine`]
//! is the entry point.

pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod search;
pub mod spatial;
pub mod store;
pub mod text;
pub mod types;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use engine::{EngineStats, GeoTagEngine};
pub use error::{GeoError, GeoResult};
pub use ingest::{BulkOutcome, IndexKind, ItemOutcome, ReconcileReport};
pub use search::{GeoFilter, Modalities, Modality, SearchResult, UnifiedQuery, UnifiedSearchResponse};
pub use types::{
    Coordinate, LocationId, LocationPatch, LocationRecord, NewLocation, RecordStatus,
};
pub use vector::{EmbeddingGenerator, HashingEmbedder, VectorDimension, VectorMode};
