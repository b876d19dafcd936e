//! Collaborator traits
//!
//! The orchestrator works through these interfaces only. Concrete bindings
//! (Google Genomics, metadata-server credentials, object storage) live in the
//! runner crate; tests substitute scripted in-memory versions.

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::types::*;

/// Result type for collaborator operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Raw, single-shot access to the remote execution service.
///
/// Implementations report every failure as-is. Retrying transient failures is
/// the job of the client wrapping the backend, not the backend itself.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Submit a job, returning the new operation handle
    async fn submit(&self, request: &JobRequest) -> Result<RemoteOperation>;

    /// Fetch the current state of an operation
    async fn get_operation(&self, name: &str) -> Result<RemoteOperation>;

    /// Fleet-management preemption records for an instance
    async fn list_preemption_events(
        &self,
        instance: &str,
        zone: &str,
    ) -> Result<Vec<PreemptionEvent>>;
}

/// Supplies bearer tokens for remote APIs
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Object-storage existence lookup
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether the object at `path` (e.g. `gs://bucket/key`) exists
    async fn exists(&self, path: &str) -> Result<bool>;
}
