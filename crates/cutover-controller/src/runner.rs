//! Per-deployment state machine task.
//!
//! The loop is: load the record, run the entry action of its state, commit
//! the planned transition, repeat until terminal. Entry actions are
//! idempotent so a reload (after a crash, a cancel or a lost commit race)
//! can always run them again.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep_until;
use tracing::{debug, error, info, warn};

use cutover_health::HealthProber;
use cutover_router::TrafficRouter;
use cutover_state::{
    Deployment, DeploymentId, DeploymentState, DeploymentStore, FailureKind, StateError,
    StateResult, TaskSetId,
};
use cutover_taskset::{TaskSetError, TaskSetManager, TaskSetRequest};

use crate::events::DeploymentEvent;
use crate::gate::{self, Verdict, VerifyWindow};

/// Everything a runner needs, shared with the controller.
pub(crate) struct Shared {
    pub store: DeploymentStore,
    pub task_sets: Arc<TaskSetManager>,
    pub router: Arc<TrafficRouter>,
    pub prober: Arc<HealthProber>,
    pub events: broadcast::Sender<DeploymentEvent>,
}

type Edit = Box<dyn Fn(&mut Deployment) + Send + Sync>;

/// A transition decided by an entry action, not yet persisted.
///
/// The edit is a closure so it can be replayed onto a reloaded record when
/// the first commit loses a version race.
struct Plan {
    to: DeploymentState,
    edit: Edit,
}

impl Plan {
    fn to(state: DeploymentState) -> Self {
        Self {
            to: state,
            edit: Box::new(|_| {}),
        }
    }

    fn with(self, edit: impl Fn(&mut Deployment) + Send + Sync + 'static) -> Self {
        let previous = self.edit;
        Self {
            to: self.to,
            edit: Box::new(move |d| {
                previous(d);
                edit(d);
            }),
        }
    }

    fn failing(state: DeploymentState, kind: FailureKind, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::to(state).with(move |d| d.record_failure(kind, reason.clone()))
    }

    fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::failing(DeploymentState::Failed, kind, reason)
    }

    fn roll_back(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::failing(DeploymentState::RollingBack, kind, reason)
    }

    fn orphan(self, task_set_id: TaskSetId) -> Self {
        self.with(move |d| d.orphaned_task_set_id = Some(task_set_id.clone()))
    }
}

enum Step {
    Advance(Plan),
    /// Re-read the record and run the (possibly new) state again.
    Reload,
    /// The controller is shutting down.
    Stop,
}

/// Drive one deployment until it is terminal or the controller stops.
pub(crate) async fn drive(shared: Arc<Shared>, id: DeploymentId, mut cancel: watch::Receiver<bool>) {
    loop {
        let deployment = match shared.store.get_deployment(&id) {
            Ok(Some(d)) => d,
            Ok(None) => {
                error!(deployment = %id, "deployment record vanished");
                return;
            }
            Err(e) => {
                error!(deployment = %id, error = %e, "failed to load deployment; runner stopping");
                return;
            }
        };

        if deployment.state.is_terminal() {
            finish(&shared, &deployment).await;
            return;
        }

        debug!(deployment = %id, state = %deployment.state, "entering state");
        let step = enter(&shared, &deployment, &mut cancel).await;
        match step {
            Step::Advance(plan) => {
                if let Err(e) = commit(&shared, deployment, plan) {
                    error!(deployment = %id, error = %e, "failed to persist transition; runner stopping");
                    return;
                }
            }
            Step::Reload => continue,
            Step::Stop => {
                debug!(deployment = %id, "runner stopped");
                return;
            }
        }
    }
}

async fn enter(shared: &Shared, d: &Deployment, cancel: &mut watch::Receiver<bool>) -> Step {
    match d.state {
        DeploymentState::Requested => requested(shared, d).await,
        DeploymentState::ProvisioningGreen => provisioning_green(shared, d).await,
        DeploymentState::AwaitingHealth => awaiting_health(shared, d, cancel).await,
        DeploymentState::ShiftingTraffic => shifting_traffic(shared, d).await,
        DeploymentState::PostShiftVerify => post_shift_verify(shared, d, cancel).await,
        DeploymentState::DrainingBlue => draining_blue(shared, d).await,
        DeploymentState::RollingBack => rolling_back(shared, d).await,
        DeploymentState::Completed | DeploymentState::RolledBack | DeploymentState::Failed => {
            Step::Stop
        }
    }
}

/// Persist `plan` on top of `current`.
///
/// A version conflict means someone else wrote the record, which can only
/// be a cancel. If the reload shows a new cancel request the plan is
/// dropped and the state is re-evaluated; otherwise it is replayed.
fn commit(shared: &Shared, mut current: Deployment, plan: Plan) -> StateResult<()> {
    let from = current.state;
    loop {
        let mut next = current.clone();
        (plan.edit)(&mut next);
        next.enter(plan.to);

        match shared.store.update_deployment(&next) {
            Ok(stored) => {
                if stored.state.is_terminal() {
                    info!(
                        deployment = %stored.id,
                        service = %stored.service_name,
                        from = %from,
                        to = %stored.state,
                        failure = ?stored.failure_kind,
                        reason = ?stored.failure_reason,
                        "deployment finished"
                    );
                } else {
                    info!(deployment = %stored.id, service = %stored.service_name, from = %from, to = %stored.state, "transition");
                }
                let _ = shared.events.send(DeploymentEvent {
                    deployment_id: stored.id.clone(),
                    service_name: stored.service_name.clone(),
                    from,
                    to: stored.state,
                    failure_kind: stored.failure_kind,
                    at: Utc::now(),
                });
                return Ok(());
            }
            Err(e) if e.is_conflict() => {
                let fresh = shared
                    .store
                    .get_deployment(&current.id)?
                    .ok_or_else(|| StateError::NotFound(current.id.clone()))?;
                if fresh.state != from || (fresh.cancel_requested && !current.cancel_requested) {
                    debug!(deployment = %fresh.id, planned = %plan.to, "transition superseded by concurrent update");
                    return Ok(());
                }
                debug!(deployment = %fresh.id, version = fresh.version, "version conflict; replaying transition");
                current = fresh;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn finish(shared: &Shared, d: &Deployment) {
    if let Some(green) = &d.green_task_set_id {
        shared.prober.unsubscribe(green).await;
    }
    if d.state == DeploymentState::Failed && d.failure_kind == Some(FailureKind::DegradedRollback) {
        error!(
            deployment = %d.id,
            service = %d.service_name,
            live_task_set = ?d.live_task_set_id(),
            "deployment failed with both task sets running; operator action required"
        );
    }
}

// ── Entry actions ──────────────────────────────────────────────────

async fn requested(shared: &Shared, d: &Deployment) -> Step {
    if d.cancel_requested {
        return Step::Advance(Plan::failed(
            FailureKind::Cancelled,
            "cancelled before provisioning",
        ));
    }

    let mut blue = shared.router.live_task_set(&d.service_name).await;
    let mut desired = d.desired_count;
    if let Some(blue_id) = blue.clone() {
        match shared.task_sets.status(&blue_id).await {
            Ok(status) if status.task_set.is_live() => desired = status.task_set.desired_count,
            Ok(status) => {
                warn!(
                    deployment = %d.id,
                    blue = %blue_id,
                    state = ?status.task_set.lifecycle_state,
                    "routed task set is not live; treating as first deployment"
                );
                blue = None;
            }
            Err(TaskSetError::NotFound(_)) => {
                warn!(deployment = %d.id, blue = %blue_id, "routed task set no longer exists");
                blue = None;
            }
            Err(e) => {
                warn!(deployment = %d.id, blue = %blue_id, error = %e, "blue status unavailable; keeping requested count");
            }
        }
    }

    info!(deployment = %d.id, service = %d.service_name, blue = ?blue, desired, "resolved blue task set");
    Step::Advance(Plan::to(DeploymentState::ProvisioningGreen).with(move |d| {
        d.blue_task_set_id = blue.clone();
        d.desired_count = desired;
    }))
}

async fn provisioning_green(shared: &Shared, d: &Deployment) -> Step {
    let key = d.green_key();

    if d.cancel_requested {
        // A create may have landed before the cancel was seen.
        let mut plan = Plan::failed(FailureKind::Cancelled, "cancelled during provisioning");
        match shared.task_sets.find_by_key(&key).await {
            Ok(Some(green)) => {
                if let Err(e) = shared.task_sets.terminate(&green.id).await {
                    warn!(deployment = %d.id, green = %green.id, error = %e, "could not terminate green; leaving for sweep");
                    plan = plan.orphan(green.id);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(deployment = %d.id, error = %e, "green lookup failed during cancel"),
        }
        return Step::Advance(plan);
    }

    let request = TaskSetRequest {
        idempotency_key: key,
        service_name: d.service_name.clone(),
        image_ref: d.target_image_ref.clone(),
        desired_count: d.desired_count,
        secret_refs: d.secret_refs.clone(),
    };
    match shared.task_sets.create(&request).await {
        Ok(green) => Step::Advance(
            Plan::to(DeploymentState::AwaitingHealth)
                .with(move |d| d.green_task_set_id = Some(green.id.clone())),
        ),
        Err(e) => {
            let kind = match e {
                TaskSetError::Capacity(_) => FailureKind::Capacity,
                TaskSetError::Image(_) => FailureKind::Image,
                TaskSetError::NotFound(_) | TaskSetError::Platform(_) => FailureKind::Infrastructure,
            };
            warn!(deployment = %d.id, error = %e, ?kind, "green provisioning failed");
            Step::Advance(Plan::failed(kind, e.to_string()))
        }
    }
}

async fn awaiting_health(
    shared: &Shared,
    d: &Deployment,
    cancel: &mut watch::Receiver<bool>,
) -> Step {
    let Some(green) = d.green_task_set_id.clone() else {
        return Step::Advance(Plan::roll_back(
            FailureKind::Infrastructure,
            "green task set missing",
        ));
    };
    if d.cancel_requested {
        return Step::Advance(Plan::roll_back(
            FailureKind::Cancelled,
            "cancelled while awaiting health",
        ));
    }

    let policy = &d.health_policy;
    let mut snapshots = shared.prober.subscribe(&green, policy).await;
    let deadline = gate::deadline(d.state_entered_at, policy.deployment_timeout);

    loop {
        let latest = snapshots.borrow_and_update().clone();
        if gate::awaiting_health(latest.as_ref(), policy) == Verdict::Pass {
            info!(deployment = %d.id, green = %green, "green is healthy");
            // Written before the shift so a rollback knows to revert it.
            return Step::Advance(
                Plan::to(DeploymentState::ShiftingTraffic).with(|d| d.traffic_shifted = true),
            );
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Step::Stop;
                }
            }
            _ = sleep_until(deadline) => {
                let observed = latest
                    .map(|s| format!("{}/{} healthy, {} passing cycles", s.healthy_count, s.total_count, s.consecutive_success_cycles))
                    .unwrap_or_else(|| "no probe results".to_string());
                warn!(deployment = %d.id, green = %green, %observed, "health deadline passed");
                return Step::Advance(Plan::roll_back(
                    FailureKind::HealthTimeout,
                    format!("green not healthy within {:?}: {observed}", policy.deployment_timeout),
                ));
            }
            signal = cancel.changed() => return on_signal(signal),
        }
    }
}

async fn shifting_traffic(shared: &Shared, d: &Deployment) -> Step {
    let Some(green) = d.green_task_set_id.clone() else {
        return Step::Advance(Plan::roll_back(
            FailureKind::Infrastructure,
            "green task set missing",
        ));
    };
    if d.cancel_requested {
        return Step::Advance(Plan::roll_back(
            FailureKind::Cancelled,
            "cancelled before traffic shift",
        ));
    }

    match shared.router.shift_all(&d.service_name, &green).await {
        Ok(assignment) => {
            debug!(deployment = %d.id, revision = assignment.revision, "traffic on green");
            Step::Advance(Plan::to(DeploymentState::PostShiftVerify))
        }
        Err(e) => {
            warn!(deployment = %d.id, green = %green, error = %e, "traffic shift failed");
            Step::Advance(Plan::roll_back(FailureKind::Router, e.to_string()))
        }
    }
}

async fn post_shift_verify(
    shared: &Shared,
    d: &Deployment,
    cancel: &mut watch::Receiver<bool>,
) -> Step {
    let Some(green) = d.green_task_set_id.clone() else {
        return Step::Advance(Plan::roll_back(
            FailureKind::Infrastructure,
            "green task set missing",
        ));
    };
    if d.cancel_requested {
        return Step::Advance(Plan::roll_back(
            FailureKind::Cancelled,
            "cancelled during post-shift verification",
        ));
    }

    let policy = &d.health_policy;
    let mut snapshots = shared.prober.subscribe(&green, policy).await;
    let deadline = gate::deadline(d.state_entered_at, policy.deployment_timeout);
    let grace_end = gate::deadline(d.state_entered_at, policy.propagation_grace_period);
    let timed_out = || {
        Step::Advance(Plan::roll_back(
            FailureKind::HealthTimeout,
            format!("green not verified within {:?} after shift", policy.deployment_timeout),
        ))
    };

    // Convergence window: results during the grace period are ignored.
    tokio::select! {
        _ = sleep_until(grace_end) => {}
        _ = sleep_until(deadline) => return timed_out(),
        signal = cancel.changed() => return on_signal(signal),
    }

    let baseline = snapshots
        .borrow_and_update()
        .as_ref()
        .map(|s| s.cycle)
        .unwrap_or(0);
    let window = VerifyWindow::new(baseline, policy.evaluation_window);
    debug!(deployment = %d.id, baseline, "grace period over; verifying green");

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Step::Stop;
                }
                let latest = snapshots.borrow_and_update().clone();
                let Some(snapshot) = latest else { continue };
                match window.judge(&snapshot) {
                    Verdict::Pass => {
                        info!(deployment = %d.id, green = %green, "green verified under traffic");
                        return Step::Advance(Plan::to(DeploymentState::DrainingBlue));
                    }
                    Verdict::Fail(reason) => {
                        warn!(deployment = %d.id, green = %green, %reason, "post-shift regression");
                        return Step::Advance(Plan::roll_back(FailureKind::HealthRegressed, reason));
                    }
                    Verdict::Pending => {}
                }
            }
            _ = sleep_until(deadline) => return timed_out(),
            signal = cancel.changed() => return on_signal(signal),
        }
    }
}

async fn draining_blue(shared: &Shared, d: &Deployment) -> Step {
    // Cancellation no longer applies here: traffic is committed to green.
    let mut plan = Plan::to(DeploymentState::Completed);
    if let Some(blue) = d.blue_task_set_id.clone() {
        if let Err(e) = shared.task_sets.terminate(&blue).await {
            warn!(deployment = %d.id, blue = %blue, error = %e, "blue termination failed; leaving for sweep");
            plan = plan.orphan(blue);
        }
    }
    Step::Advance(plan)
}

async fn rolling_back(shared: &Shared, d: &Deployment) -> Step {
    // `traffic_shifted` is written before the shift is attempted; the router
    // says whether green actually took traffic.
    let green_routed = match &d.green_task_set_id {
        Some(green) if d.traffic_shifted => {
            shared.router.live_task_set(&d.service_name).await.as_ref() == Some(green)
        }
        _ => false,
    };
    let cause = d.failure_reason.as_deref().unwrap_or("unknown");

    if green_routed {
        match &d.blue_task_set_id {
            Some(blue) => {
                if let Err(e) = shared.router.shift_all(&d.service_name, blue).await {
                    error!(
                        deployment = %d.id,
                        service = %d.service_name,
                        live_task_set = ?d.green_task_set_id,
                        blue = %blue,
                        error = %e,
                        "rollback could not restore traffic to blue"
                    );
                    return Step::Advance(Plan::failed(
                        FailureKind::DegradedRollback,
                        format!("rollback shift failed: {e} (rolling back because: {cause})"),
                    ));
                }
                info!(deployment = %d.id, blue = %blue, "traffic restored to blue");
            }
            None => {
                // First deployment of the service: green is the only set
                // carrying traffic, so it stays up.
                let kind = d.failure_kind.unwrap_or(FailureKind::HealthRegressed);
                error!(
                    deployment = %d.id,
                    service = %d.service_name,
                    live_task_set = ?d.green_task_set_id,
                    %cause,
                    "no previous task set to roll back to; green left serving"
                );
                return Step::Advance(Plan::failed(
                    kind,
                    format!("no previous task set to restore; green left serving traffic ({cause})"),
                ));
            }
        }
    }

    let mut plan = Plan::to(DeploymentState::RolledBack);
    if d.traffic_shifted && !green_routed {
        debug!(deployment = %d.id, "shift to green never took effect; nothing to revert");
        plan = plan.with(|d| d.traffic_shifted = false);
    }
    if let Some(green) = d.green_task_set_id.clone() {
        shared.prober.unsubscribe(&green).await;
        if let Err(e) = shared.task_sets.terminate(&green).await {
            warn!(deployment = %d.id, green = %green, error = %e, "green termination failed; leaving for sweep");
            plan = plan.orphan(green);
        }
    }
    Step::Advance(plan)
}

fn on_signal(signal: Result<(), watch::error::RecvError>) -> Step {
    match signal {
        Ok(()) => Step::Reload,
        Err(_) => Step::Stop,
    }
}
