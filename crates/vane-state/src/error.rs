//! Error types for the Vane object store.

use thiserror::Error;

use crate::object::Kind;

/// Result type alias for object store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during object store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("{kind} {key} not found")]
    NotFound { kind: Kind, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: Kind, key: String },

    #[error("{kind} {key}: resource version {expected} is stale (current {actual})")]
    Conflict {
        kind: Kind,
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StateError {
    /// Optimistic-concurrency failure; the caller should re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StateError::AlreadyExists { .. })
    }
}
