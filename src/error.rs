//! Error taxonomy for the GraphRAG core.
//!
//! Component boundaries translate internal failures into one of the kinds
//! below; the HTTP layer maps each kind to a status code and a stable
//! machine-readable code string. Raw storage/provider errors never escape
//! the public API.

use thiserror::Error;

/// Unified error type for all GraphLoom components.
#[derive(Debug, Error)]
pub enum GraphLoomError {
    /// Malformed input: missing doc_id/text, unknown mode, oversized batch.
    /// No state is mutated before validation completes.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown node, snapshot, namespace, or run.
    #[error("not found: {0}")]
    NotFound(String),

    /// Lock contention or a concurrent writer: index run already in
    /// progress, analytics job already active for the namespace.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The graph backend is unreachable. The storage adapter catches this
    /// kind and retries the operation on the embedded store.
    #[error("graph backend unavailable: {0}")]
    BackendUnavailable(String),

    /// An LLM or embedding provider failed fatally (after retries).
    /// Callers degrade: heuristic extraction, empty embeddings,
    /// retrieval-only answers.
    #[error("provider failure: {0}")]
    ProviderFailure(String),

    /// Timeouts and 5xx responses from providers; retried with backoff
    /// before being surfaced as [`GraphLoomError::ProviderFailure`].
    #[error("transient provider error: {0}")]
    Transient(String),

    /// A run directory is missing its core artifacts during import.
    #[error("corrupt artifact: {0}")]
    CorruptArtifact(String),

    /// Storage integrity violation, e.g. an identity collision with
    /// divergent labels. Not auto-healed.
    #[error("storage integrity violation: {0}")]
    Fatal(String),

    /// A query was cancelled between pipeline stages.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraphLoomError {
    /// Stable machine-readable error kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) | Self::Cancelled(_) => "conflict",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::ProviderFailure(_) => "provider_failure",
            Self::Transient(_) => "transient",
            Self::CorruptArtifact(_) => "corrupt_artifact",
            Self::Fatal(_) => "fatal",
            Self::Storage(_) | Self::Io(_) | Self::Json(_) => "internal",
        }
    }

    /// HTTP status for the public API layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::Cancelled(_) => 409,
            Self::BackendUnavailable(_) => 503,
            Self::ProviderFailure(_) | Self::Transient(_) => 502,
            Self::CorruptArtifact(_) => 422,
            Self::Fatal(_) | Self::Storage(_) | Self::Io(_) | Self::Json(_) => 500,
        }
    }

    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, GraphLoomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(GraphLoomError::Validation("x".into()).kind(), "validation");
        assert_eq!(GraphLoomError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(GraphLoomError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(
            GraphLoomError::BackendUnavailable("x".into()).kind(),
            "backend_unavailable"
        );
        assert_eq!(GraphLoomError::Fatal("x".into()).status_code(), 500);
        assert_eq!(GraphLoomError::Validation("x".into()).status_code(), 400);
        assert_eq!(GraphLoomError::Conflict("x".into()).status_code(), 409);
    }
}
