//! Transition notifications.

use chrono::{DateTime, Utc};
use serde::Serialize;

use cutover_state::{DeploymentId, DeploymentState, FailureKind};

/// Published after every persisted transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentEvent {
    pub deployment_id: DeploymentId,
    pub service_name: String,
    pub from: DeploymentState,
    pub to: DeploymentState,
    pub failure_kind: Option<FailureKind>,
    pub at: DateTime<Utc>,
}

impl DeploymentEvent {
    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}
