//! Task set manager error types.

use thiserror::Error;

use crate::platform::PlatformError;

/// Errors surfaced by the task set manager once retries are spent.
#[derive(Debug, Error)]
pub enum TaskSetError {
    /// The platform cannot run the requested instance count.
    #[error("insufficient capacity: {0}")]
    Capacity(String),

    /// The image reference is malformed or cannot be resolved.
    #[error("image error: {0}")]
    Image(String),

    #[error("task set not found: {0}")]
    NotFound(String),

    /// Transient platform failures outlasted the retry budget.
    #[error("platform error: {0}")]
    Platform(String),
}

impl From<PlatformError> for TaskSetError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::Capacity(msg) => TaskSetError::Capacity(msg),
            PlatformError::Image(msg) => TaskSetError::Image(msg),
            PlatformError::NotFound(id) => TaskSetError::NotFound(id),
            PlatformError::Unavailable(msg) => TaskSetError::Platform(msg),
        }
    }
}

pub type TaskSetResult<T> = Result<T, TaskSetError>;
