//! Crate-wide error type.
//!
//! Every fallible operation in `memoria-core` ultimately surfaces one of the
//! kinds below. Components keep their own `thiserror` enums (`StorageError`,
//! `EmbeddingError`, ...) for precise `#[from]` conversions and convert into
//! `MemoriaError` at the boundary a caller actually observes.

use thiserror::Error;

/// Top-level error kind, mapped onto the five dispositions a transport
/// collaborator is expected to translate into a status code.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum MemoriaError {
    /// User or memory missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or invalid credential. Never reveals whether a user exists.
    #[error("unauthorized")]
    Unauthorized,

    /// Input constraint violation (size limits, empty text, bad content type).
    #[error("validation error: {0}")]
    Validation(String),

    /// LM, DB, object store, or web adapter unreachable.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Retryable I/O that the owning component has already retried.
    #[error("transient error: {0}")]
    Transient(String),

    /// Unexpected failure; only the generic message should reach a caller.
    #[error("internal error")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl MemoriaError {
    pub fn internal<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        MemoriaError::Internal(Box::new(err))
    }
}

impl From<crate::storage::StorageError> for MemoriaError {
    fn from(err: crate::storage::StorageError) -> Self {
        match err {
            crate::storage::StorageError::NotFound(msg) => MemoriaError::NotFound(msg),
            crate::storage::StorageError::Validation(msg) => MemoriaError::Validation(msg),
            other => MemoriaError::internal(other),
        }
    }
}

impl From<crate::embeddings::EmbeddingError> for MemoriaError {
    fn from(err: crate::embeddings::EmbeddingError) -> Self {
        MemoriaError::DependencyUnavailable(err.to_string())
    }
}

impl From<crate::llm::LlmError> for MemoriaError {
    fn from(err: crate::llm::LlmError) -> Self {
        match err {
            crate::llm::LlmError::Unavailable(msg) => MemoriaError::DependencyUnavailable(msg),
            other => MemoriaError::Transient(other.to_string()),
        }
    }
}

impl From<crate::web::WebError> for MemoriaError {
    fn from(err: crate::web::WebError) -> Self {
        match err {
            crate::web::WebError::Request(msg) => MemoriaError::DependencyUnavailable(msg),
            crate::web::WebError::NoContent(msg) => MemoriaError::Transient(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoriaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_roundtrips() {
        let err = MemoriaError::NotFound("memory 123".into());
        assert_eq!(err.to_string(), "not found: memory 123");
    }

    #[test]
    fn internal_wraps_source() {
        let io_err = std::io::Error::other("boom");
        let err = MemoriaError::internal(io_err);
        assert_eq!(err.to_string(), "internal error");
    }
}
