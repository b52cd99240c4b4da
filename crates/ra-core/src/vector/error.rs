//! Vector store error types.

use thiserror::Error;

/// Errors that can occur during vector store operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VectorStoreError {
    /// Dimension mismatch between query and index.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation timed out.
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Embedding could not be produced.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Internal error from the vector database.
    #[error("internal error: {0}")]
    Internal(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },
}

impl VectorStoreError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VectorStoreError::Connection(_)
                | VectorStoreError::Timeout(_)
                | VectorStoreError::RateLimited { .. }
        )
    }
}

/// Result type for vector store operations.
pub type VectorStoreResult<T> = Result<T, VectorStoreError>;
