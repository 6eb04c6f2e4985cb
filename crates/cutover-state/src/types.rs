//! Domain types shared by every Cutover crate.
//!
//! These are the persisted shapes: deployments (with their transition
//! history), task sets and instances as reported by the platform.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cutover_core::HealthPolicy;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for a task set.
pub type TaskSetId = String;

// ── Deployment ─────────────────────────────────────────────────────

/// Where a deployment is in the blue/green state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    Requested,
    ProvisioningGreen,
    AwaitingHealth,
    ShiftingTraffic,
    PostShiftVerify,
    DrainingBlue,
    RollingBack,
    Completed,
    RolledBack,
    Failed,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Completed | DeploymentState::RolledBack | DeploymentState::Failed
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::ProvisioningGreen => "PROVISIONING_GREEN",
            Self::AwaitingHealth => "AWAITING_HEALTH",
            Self::ShiftingTraffic => "SHIFTING_TRAFFIC",
            Self::PostShiftVerify => "POST_SHIFT_VERIFY",
            Self::DrainingBlue => "DRAINING_BLUE",
            Self::RollingBack => "ROLLING_BACK",
            Self::Completed => "COMPLETED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a deployment did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The platform could not provide the requested instances.
    Capacity,
    /// The image reference could not be resolved.
    Image,
    /// Green never met the health policy in time.
    HealthTimeout,
    /// Green failed health checks after taking traffic.
    HealthRegressed,
    /// The traffic shift to green failed.
    Router,
    /// Rollback could not restore traffic; capacity is single-sided.
    DegradedRollback,
    /// An operator cancelled the deployment.
    Cancelled,
    /// Infrastructure kept failing past the retry budget.
    Infrastructure,
}

/// One entry in a deployment's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: DeploymentState,
    pub entered_at: DateTime<Utc>,
}

/// One attempt to move a service to a new image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub service_name: String,
    pub target_image_ref: String,
    pub state: DeploymentState,
    /// The previously-live set. `None` when bootstrapping a new service.
    pub blue_task_set_id: Option<TaskSetId>,
    /// The candidate set, once provisioned.
    pub green_task_set_id: Option<TaskSetId>,
    pub desired_count: u32,
    /// Opaque secret key names handed to the platform untouched.
    #[serde(default)]
    pub secret_refs: Vec<String>,
    pub health_policy: HealthPolicy,
    pub created_at: DateTime<Utc>,
    pub state_entered_at: DateTime<Utc>,
    pub failure_kind: Option<FailureKind>,
    pub failure_reason: Option<String>,
    /// Set before traffic is pointed at green; rollback only reverts when set.
    pub traffic_shifted: bool,
    pub cancel_requested: bool,
    /// A set whose termination failed, left for the reconcile sweep.
    pub orphaned_task_set_id: Option<TaskSetId>,
    /// Optimistic-concurrency counter, bumped by the store on every write.
    pub version: u64,
    pub history: Vec<Transition>,
}

impl Deployment {
    /// Build a new deployment in `REQUESTED`.
    ///
    /// `desired_count` is only a fallback; the controller replaces it with
    /// the live set's count when one exists.
    pub fn new(
        service_name: &str,
        target_image_ref: &str,
        health_policy: HealthPolicy,
        desired_count: u32,
        secret_refs: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service_name: service_name.to_string(),
            target_image_ref: target_image_ref.to_string(),
            state: DeploymentState::Requested,
            blue_task_set_id: None,
            green_task_set_id: None,
            desired_count,
            secret_refs,
            health_policy,
            created_at: now,
            state_entered_at: now,
            failure_kind: None,
            failure_reason: None,
            traffic_shifted: false,
            cancel_requested: false,
            orphaned_task_set_id: None,
            version: 0,
            history: vec![Transition {
                state: DeploymentState::Requested,
                entered_at: now,
            }],
        }
    }

    /// Move to `state`, resetting the state clock and recording history.
    pub fn enter(&mut self, state: DeploymentState) {
        let now = Utc::now();
        self.state = state;
        self.state_entered_at = now;
        self.history.push(Transition {
            state,
            entered_at: now,
        });
    }

    pub fn record_failure(&mut self, kind: FailureKind, reason: impl Into<String>) {
        self.failure_kind = Some(kind);
        self.failure_reason = Some(reason.into());
    }

    /// Idempotency key for the green task set of this deployment.
    pub fn green_key(&self) -> String {
        format!("{}/green", self.id)
    }

    /// The task set currently expected to be serving traffic.
    pub fn live_task_set_id(&self) -> Option<&TaskSetId> {
        let green_live = match self.state {
            DeploymentState::Completed | DeploymentState::DrainingBlue => true,
            DeploymentState::RolledBack => false,
            // A failed rollback leaves traffic wherever the last shift put it.
            _ => self.traffic_shifted,
        };
        if green_live {
            self.green_task_set_id.as_ref()
        } else {
            self.blue_task_set_id.as_ref()
        }
    }

    /// Time spent in the current state.
    pub fn time_in_state(&self) -> std::time::Duration {
        (Utc::now() - self.state_entered_at)
            .to_std()
            .unwrap_or_default()
    }
}

// ── Task set ───────────────────────────────────────────────────────

/// Lifecycle of a task set as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Provisioning,
    Steady,
    Draining,
    Terminated,
}

/// A named, versioned group of running instances of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSet {
    pub id: TaskSetId,
    pub service_name: String,
    pub image_ref: String,
    pub idempotency_key: String,
    pub desired_count: u32,
    pub observed_healthy_count: u32,
    pub observed_total_count: u32,
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub secret_refs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskSet {
    /// Steady with a non-zero desired count: able to carry traffic.
    pub fn is_live(&self) -> bool {
        self.lifecycle_state == LifecycleState::Steady && self.desired_count > 0
    }
}

/// One running instance inside a task set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub task_set_id: TaskSetId,
    /// `host:port` the liveness probe connects to.
    pub address: String,
}
