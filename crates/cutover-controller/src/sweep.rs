//! Reconcile sweep: retries terminations that failed during a deployment.
//!
//! DRAINING_BLUE and ROLLING_BACK never block on a failed terminate; they
//! record the set as orphaned and finish. The sweep walks terminal
//! deployments, terminates each orphan and clears the marker.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::error::ControllerResult;

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub cleaned: usize,
    pub failed: usize,
}

impl Controller {
    /// Terminate every orphaned task set recorded on a terminal deployment.
    pub async fn sweep(&self) -> ControllerResult<SweepReport> {
        let shared = self.shared();
        let mut report = SweepReport::default();

        let orphaned: Vec<_> = shared
            .store
            .list_deployments()?
            .into_iter()
            .filter(|d| d.state.is_terminal() && d.orphaned_task_set_id.is_some())
            .collect();

        for deployment in orphaned {
            let Some(task_set_id) = deployment.orphaned_task_set_id.clone() else {
                continue;
            };
            report.attempted += 1;

            if let Err(e) = shared.task_sets.terminate(&task_set_id).await {
                warn!(deployment = %deployment.id, task_set = %task_set_id, error = %e, "orphan termination failed again");
                report.failed += 1;
                continue;
            }

            // Only the sweep writes terminal records, so a conflict just
            // means a concurrent sweep; reload and clear once more.
            let mut current = deployment;
            loop {
                current.orphaned_task_set_id = None;
                match shared.store.update_deployment(&current) {
                    Ok(_) => break,
                    Err(e) if e.is_conflict() => {
                        match shared.store.get_deployment(&current.id)? {
                            Some(fresh) if fresh.orphaned_task_set_id.is_some() => current = fresh,
                            _ => break,
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            info!(deployment = %current.id, task_set = %task_set_id, "orphaned task set cleaned up");
            report.cleaned += 1;
        }

        if report.attempted > 0 {
            info!(?report, "sweep finished");
        } else {
            debug!("sweep found nothing to clean");
        }
        Ok(report)
    }
}

/// Run [`Controller::sweep`] every `period` until `shutdown` flips.
pub async fn run_sweeper(
    controller: Arc<Controller>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so startup is quiet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = controller.sweep().await {
                    warn!(error = %e, "sweep failed");
                }
            }
            _ = shutdown.changed() => {
                debug!("sweeper stopping");
                return;
            }
        }
    }
}
