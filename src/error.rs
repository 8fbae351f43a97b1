//! Error types for the geo-tag search engine
//!
//! This module provides structured error types using thiserror. Every layer
//! has its own error enum; `GeoError` is the one callers of the engine see.

use crate::store::StoreError;
use crate::text::TextIndexError;
use crate::types::LocationId;
use crate::vector::VectorError;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum GeoError {
    /// Malformed input, rejected before any mutation
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Identity absent or deleted
    #[error("Location {id} not found. It may never have existed or has been deleted.")]
    NotFound { id: LocationId },

    /// The embedding capability could not produce a vector
    #[error("Embedding generation failed: {reason}")]
    EmbeddingFailed { reason: String },

    /// Detected and repaired by reconciliation; never returned from a caller's request
    #[error("Index '{index}' is inconsistent for location {id}: {reason}")]
    IndexInconsistency {
        id: LocationId,
        index: &'static str,
        reason: String,
    },

    /// Request exceeds a configured bound
    #[error("{what} of {requested} exceeds the configured maximum of {limit}")]
    CapacityExceeded {
        what: &'static str,
        requested: String,
        limit: String,
    },

    /// Query cannot be executed as specified
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },

    /// Record Store failures
    #[error("Record store error: {0}")]
    Store(StoreError),

    /// Text index failures
    #[error("Text index error: {0}")]
    Text(#[from] TextIndexError),

    /// Vector index failures
    #[error("Vector index error: {0}")]
    Vector(#[from] VectorError),

    /// Configuration errors
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl GeoError {
    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> String {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::EmbeddingFailed { .. } => "EMBEDDING_FAILURE",
            Self::IndexInconsistency { .. } => "INDEX_INCONSISTENCY",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::InvalidQuery { .. } => "INVALID_QUERY",
            Self::Store(_) => "STORE_ERROR",
            Self::Text(_) => "TEXT_INDEX_ERROR",
            Self::Vector(_) => "VECTOR_INDEX_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
        }
        .to_string()
    }

    /// Whether the error was raised before any state was touched.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::CapacityExceeded { .. } | Self::InvalidQuery { .. }
        )
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Validation { .. } => vec![
                "Latitude must be within [-90, 90] and longitude within [-180, 180]",
            ],
            Self::CapacityExceeded { .. } => vec![
                "Split bulk requests into smaller batches",
                "Reduce the search radius or raise the configured maximum",
            ],
            Self::InvalidQuery { .. } => vec![
                "Enable at least one of the text, vector or location modalities",
                "Provide query text for text/vector search and a coordinate for location search",
            ],
            Self::EmbeddingFailed { .. } => vec![
                "The record was stored without a vector; run 'geotag reconcile' to retry",
                "Check that the embedding model is available",
            ],
            Self::Store(_) => vec![
                "Check disk space and permissions in the data directory",
                "Run 'geotag reconcile' after the store is reachable again",
            ],
            Self::Vector(_) => vec![
                "Delete the vector checkpoint; it is rebuilt from the record store on start",
            ],
            _ => vec![],
        }
    }
}

impl From<StoreError> for GeoError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound { id },
            other => Self::Store(other),
        }
    }
}

/// Result type alias for engine operations
pub type GeoResult<T> = Result<T, GeoError>;
