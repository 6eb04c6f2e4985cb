use thiserror::Error;

use cutover_state::LifecycleState;
use cutover_taskset::TaskSetError;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("task set {task_set_id} is not steady ({state:?})")]
    NotSteady {
        task_set_id: String,
        state: LifecycleState,
    },

    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    /// The backend kept refusing the update after all retries.
    #[error("router backend error: {0}")]
    Backend(String),

    #[error("task set lookup failed: {0}")]
    TaskSet(#[from] TaskSetError),
}

pub type RouterResult<T> = Result<T, RouterError>;
