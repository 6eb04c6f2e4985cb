use thiserror::Error;

use cutover_state::{DeploymentState, StateError};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("service {service} already has active deployment {deployment_id}")]
    Busy {
        service: String,
        deployment_id: String,
    },

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("deployment {id} is already {state}")]
    AlreadyTerminal { id: String, state: DeploymentState },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    State(#[from] StateError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
