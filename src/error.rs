//! Error types for llmtune
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::endpoint::EndpointError;

/// All error types that can occur in llmtune
#[derive(Debug, Error)]
pub enum TuneError {
    /// Invalid argument at tune/create entry
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Model has no entry in the price table
    #[error("No price known for model: {0}")]
    UnknownPrice(String),

    /// Template rendering failed
    #[error("Template error: {0}")]
    Template(String),

    /// Unrecoverable endpoint error
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// Cache database error
    #[error("Cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for llmtune operations
pub type Result<T> = std::result::Result<T, TuneError>;
