//! The runtime provider contract: the single capability interface every backend (local
//! daemon, cluster pod, cluster CR) implements. Exactly one provider is constructed at
//! startup from configuration and held behind `Arc<dyn RuntimeProvider>`; there is no
//! dynamic dispatch beyond this one interface.

pub mod cluster_cr;
pub mod cluster_pod;
pub mod local_daemon;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::model::{Pagination, Sandbox, SandboxFilter, SandboxSpec};

/// Errors a provider can raise. Converted into [`crate::error::ServiceError`] by the
/// service façade without reinterpretation.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime initialization failed: {0}")]
    Initialization(String),

    #[error("runtime operation failed: {0}")]
    Operation(String),

    #[error("provider-internal error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl From<ProviderError> for crate::error::ServiceError {
    fn from(err: ProviderError) -> Self {
        use crate::error::ServiceError;
        match err {
            ProviderError::NotFound(msg) => ServiceError::NotFound(msg),
            ProviderError::Conflict(msg) => ServiceError::Conflict(msg),
            ProviderError::Initialization(msg) => ServiceError::RuntimeInitialization(msg),
            ProviderError::Operation(msg) => ServiceError::RuntimeOperation(msg),
            ProviderError::Other(err) => ServiceError::RuntimeOperation(err.to_string()),
        }
    }
}

/// Point-in-time resource usage for a sandbox.
#[derive(Debug, Clone, Copy)]
pub struct SandboxMetrics {
    pub cpu_count: u32,
    pub cpu_used_percentage: f64,
    pub memory_total_in_mib: u64,
    pub memory_used_in_mib: u64,
    pub timestamp_ms: i64,
}

/// A runtime backend capable of realizing the sandbox lifecycle.
///
/// All operations are safe to call concurrently across distinct sandbox ids. Concurrent
/// mutating calls on the *same* id are serialized by the caller (the service façade), not
/// by the provider itself.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Human-readable provider name, used in logging and diagnostics.
    fn name(&self) -> &'static str;

    /// Create a sandbox. Idempotent on `id` collision: returns the existing object rather
    /// than erroring or creating a duplicate.
    async fn create(&self, spec: &SandboxSpec) -> ProviderResult<Sandbox>;

    /// Read a single sandbox by id. Must be satisfiable from cache where the provider
    /// maintains one (cluster backends, via the informer).
    async fn get(&self, id: &str) -> ProviderResult<Sandbox>;

    /// List sandboxes matching `filter`, paginated.
    async fn list(&self, filter: &SandboxFilter, pagination: Pagination) -> ProviderResult<Vec<Sandbox>>;

    /// Begin teardown. Returns once the delete has been issued to the runtime; the sandbox
    /// moves through `Stopping` to `Terminated` as the runtime confirms removal.
    async fn delete(&self, id: &str) -> ProviderResult<()>;

    /// Freeze the sandbox's process tree.
    async fn pause(&self, id: &str) -> ProviderResult<()>;

    /// Thaw a paused sandbox's process tree.
    async fn resume(&self, id: &str) -> ProviderResult<()>;

    /// Extend (never shorten) a sandbox's expiration. Rejects if `new_expiry` is not
    /// strictly in the future and strictly later than the current expiration.
    async fn renew(&self, id: &str, new_expiry: DateTime<Utc>) -> ProviderResult<DateTime<Utc>>;

    /// Resolve an addressable endpoint for `(id, port)`. `internal` requests the service's
    /// own reverse-proxy resolution, which bypasses gateway rewriting.
    async fn get_endpoint(&self, id: &str, port: u16, internal: bool) -> ProviderResult<Endpoint>;

    /// Point-in-time resource usage.
    async fn get_metrics(&self, id: &str) -> ProviderResult<SandboxMetrics>;
}
