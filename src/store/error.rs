use thiserror::Error;

use crate::types::LocationId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Location {0} not found")]
    NotFound(LocationId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(
        "Record log is corrupted at line {line}: {reason}\nSuggestion: Restore records.log from backup or truncate it after line {line}"
    )]
    CorruptedLog { line: usize, reason: String },

    #[error("Snapshot error: {0}\nSuggestion: Check that records.snapshot was not edited by hand")]
    Snapshot(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
