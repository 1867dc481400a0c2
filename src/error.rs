//! Shared error taxonomy.
//!
//! Every fallible boundary in this crate converts into a [`ServiceError`] by the time it
//! reaches the façade. Each variant carries a stable `code()` string clients can match on
//! without parsing the human-readable message.

use thiserror::Error;

/// Top-level error returned by the service façade and, by conversion, by every provider.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime initialization failed: {0}")]
    RuntimeInitialization(String),

    #[error("runtime operation failed: {0}")]
    RuntimeOperation(String),

    #[error("upstream proxy error: {0}")]
    UpstreamProxy(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ServiceError {
    /// The stable code string surfaced to clients (see the error taxonomy).
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::RuntimeInitialization(_) => "RUNTIME_INITIALIZATION_ERROR",
            ServiceError::RuntimeOperation(_) => "RUNTIME_OPERATION_ERROR",
            ServiceError::UpstreamProxy(_) => "UPSTREAM_PROXY_ERROR",
            ServiceError::Unsupported(_) => "UNSUPPORTED",
        }
    }

    /// The message component of the `{code, message}` payload. May contain runtime-supplied
    /// text; it is safe to log but is not guaranteed to be safe for all audiences.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Convenience alias used throughout the façade and providers.
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_strings_match_taxonomy() {
        assert_eq!(ServiceError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(ServiceError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(ServiceError::Conflict("x".into()).code(), "CONFLICT");
        assert_eq!(
            ServiceError::RuntimeInitialization("x".into()).code(),
            "RUNTIME_INITIALIZATION_ERROR"
        );
        assert_eq!(ServiceError::RuntimeOperation("x".into()).code(), "RUNTIME_OPERATION_ERROR");
        assert_eq!(ServiceError::UpstreamProxy("x".into()).code(), "UPSTREAM_PROXY_ERROR");
        assert_eq!(ServiceError::Unsupported("x".into()).code(), "UNSUPPORTED");
    }
}
