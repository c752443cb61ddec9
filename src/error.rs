//! Engine error taxonomy

use thiserror::Error;

/// Errors returned synchronously by schema, row, query and rule operations.
///
/// Computation failures (formula, rollup, lookup) never surface here; they
/// are written into the materialized row as sentinel values instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input shape, missing or duplicate name, invalid type reference.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dangling relation target, cross-database mismatch, unknown column.
    #[error("Referential error: {0}")]
    Referential(String),

    /// The requested record does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    /// The durable backend rejected a read or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn referential(msg: impl Into<String>) -> Self {
        EngineError::Referential(msg.into())
    }

    pub fn not_found(kind: &'static str, id: u64) -> Self {
        EngineError::NotFound { kind, id }
    }

    /// Stable machine-readable code for the wire format
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::Referential(_) => "REFERENTIAL_ERROR",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
