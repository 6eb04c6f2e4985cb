//! The infrastructure seam: whatever actually runs containers.

use async_trait::async_trait;
use thiserror::Error;

use cutover_state::{Instance, TaskSet};

/// Errors reported by a platform backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("insufficient capacity: {0}")]
    Capacity(String),

    #[error("image not resolvable: {0}")]
    Image(String),

    #[error("task set not found: {0}")]
    NotFound(String),

    /// Worth retrying: timeouts, throttling, brief outages.
    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Unavailable(_))
    }
}

/// Everything the platform needs to start a task set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSetRequest {
    pub idempotency_key: String,
    pub service_name: String,
    pub image_ref: String,
    pub desired_count: u32,
    /// Secret key names; values are resolved by the platform.
    pub secret_refs: Vec<String>,
}

/// A container-orchestration backend.
///
/// Implementations must tag task sets with the request's idempotency key
/// so `find_by_key` can answer after a controller restart. Removing or
/// draining a set that is already gone should be `Ok` or `NotFound`.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn create_task_set(&self, request: &TaskSetRequest) -> Result<TaskSet, PlatformError>;

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<TaskSet>, PlatformError>;

    async fn describe(&self, task_set_id: &str) -> Result<TaskSet, PlatformError>;

    async fn instances(&self, task_set_id: &str) -> Result<Vec<Instance>, PlatformError>;

    async fn scale(&self, task_set_id: &str, desired_count: u32) -> Result<(), PlatformError>;

    /// Stop sending new work to the set's instances.
    async fn drain(&self, task_set_id: &str) -> Result<(), PlatformError>;

    /// Stop and delete the set's instances.
    async fn remove(&self, task_set_id: &str) -> Result<(), PlatformError>;
}
