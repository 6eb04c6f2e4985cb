//! Deployment controller: accepts requests and owns the runner tasks.
//!
//! The controller is the only writer of deployment state apart from the
//! operator's cancel flag. It spawns one runner per active deployment and
//! keeps a cancel channel to each.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cutover_core::{CutoverConfig, HealthPolicy};
use cutover_health::HealthProber;
use cutover_router::{TrafficAssignment, TrafficRouter};
use cutover_state::{Deployment, DeploymentId, DeploymentStore, StateError};
use cutover_taskset::TaskSetManager;

use crate::error::{ControllerError, ControllerResult};
use crate::events::DeploymentEvent;
use crate::request::DeploymentRequest;
use crate::runner::{self, Shared};

const EVENT_CAPACITY: usize = 256;

/// Defaults applied to requests that leave fields out.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub default_policy: HealthPolicy,
    /// Instance count for a service with no live task set.
    pub default_desired_count: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            default_policy: HealthPolicy::default(),
            default_desired_count: 1,
        }
    }
}

impl ControllerSettings {
    pub fn from_config(config: &CutoverConfig) -> Self {
        Self {
            default_policy: config.policy.clone(),
            default_desired_count: config.task_sets.default_desired_count,
        }
    }
}

struct Runner {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

type Runners = Arc<Mutex<HashMap<DeploymentId, Runner>>>;

/// Drives blue/green deployments for every service.
pub struct Controller {
    shared: Arc<Shared>,
    settings: ControllerSettings,
    runners: Runners,
}

impl Controller {
    pub fn new(
        store: DeploymentStore,
        task_sets: Arc<TaskSetManager>,
        router: Arc<TrafficRouter>,
        prober: Arc<HealthProber>,
        settings: ControllerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store,
                task_sets,
                router,
                prober,
                events,
            }),
            settings,
            runners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a new deployment and start driving it.
    ///
    /// Fails with `Busy` while the service has a non-terminal deployment,
    /// including one that is rolling back.
    pub async fn submit(&self, request: DeploymentRequest) -> ControllerResult<Deployment> {
        request.validate()?;

        let policy = request
            .health_policy
            .unwrap_or_else(|| self.settings.default_policy.clone());
        let desired = request
            .desired_count
            .unwrap_or(self.settings.default_desired_count);
        let deployment = Deployment::new(
            &request.service_name,
            &request.image_ref,
            policy,
            desired,
            request.secret_refs,
        );

        let stored = match self.shared.store.create_deployment(&deployment) {
            Ok(stored) => stored,
            Err(StateError::ServiceBusy {
                service,
                deployment_id,
            }) => {
                debug!(%service, active = %deployment_id, "deployment rejected: service busy");
                return Err(ControllerError::Busy {
                    service,
                    deployment_id,
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            deployment = %stored.id,
            service = %stored.service_name,
            image = %stored.target_image_ref,
            "deployment requested"
        );
        self.spawn(&stored.id).await;
        Ok(stored)
    }

    /// Ask a running deployment to stop.
    ///
    /// The flag is persisted first, then the runner is woken. What the
    /// flag does depends on the state the runner sees next; once traffic
    /// is committed to green or a rollback is underway it changes nothing.
    pub async fn cancel(&self, id: &str) -> ControllerResult<Deployment> {
        let updated = loop {
            let mut deployment = self.get(id).await?;
            if deployment.state.is_terminal() {
                return Err(ControllerError::AlreadyTerminal {
                    id: deployment.id,
                    state: deployment.state,
                });
            }
            if deployment.cancel_requested {
                break deployment;
            }
            deployment.cancel_requested = true;
            match self.shared.store.update_deployment(&deployment) {
                Ok(stored) => break stored,
                Err(e) if e.is_conflict() => {
                    debug!(deployment = %id, "cancel raced a transition; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(deployment = %id, state = %updated.state, "cancel requested");
        if let Some(runner) = self.runners.lock().await.get(id) {
            runner.cancel.send_replace(true);
        }
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> ControllerResult<Deployment> {
        self.shared
            .store
            .get_deployment(id)?
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))
    }

    /// All deployments, oldest first.
    pub async fn list(&self) -> ControllerResult<Vec<Deployment>> {
        Ok(self.shared.store.list_deployments()?)
    }

    /// Current traffic assignment of a service.
    pub async fn traffic(&self, service_name: &str) -> Option<Arc<TrafficAssignment>> {
        self.shared.router.assignment(service_name).await
    }

    /// Restart runners for every non-terminal deployment in the store.
    ///
    /// Each runner re-enters the persisted state.
    pub async fn resume(&self) -> ControllerResult<usize> {
        let active = self.shared.store.list_active_deployments()?;
        let mut resumed = 0;
        for deployment in &active {
            if self.is_running(&deployment.id).await {
                continue;
            }
            info!(
                deployment = %deployment.id,
                service = %deployment.service_name,
                state = %deployment.state,
                "resuming deployment"
            );
            self.spawn(&deployment.id).await;
            resumed += 1;
        }
        Ok(resumed)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.shared.events.subscribe()
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.runners
            .lock()
            .await
            .get(id)
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Stop every runner and prober. Deployments stay where they are in the
    /// store and continue on the next `resume`.
    pub async fn shutdown(&self) {
        let mut runners = self.runners.lock().await;
        for (id, runner) in runners.drain() {
            runner.handle.abort();
            debug!(deployment = %id, "runner aborted");
        }
        drop(runners);
        self.shared.prober.stop_all().await;
        info!("controller stopped");
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    async fn spawn(&self, id: &str) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let runners = self.runners.clone();
        let deployment_id = id.to_string();

        // Held across the spawn so the task's own removal cannot run first.
        let mut guard = self.runners.lock().await;
        let handle = tokio::spawn(async move {
            runner::drive(shared, deployment_id.clone(), cancel_rx).await;
            let me = tokio::task::id();
            let mut runners = runners.lock().await;
            if runners.get(&deployment_id).is_some_and(|r| r.handle.id() == me) {
                runners.remove(&deployment_id);
            }
        });
        if let Some(previous) = guard.insert(
            id.to_string(),
            Runner {
                cancel: cancel_tx,
                handle,
            },
        ) {
            warn!(deployment = %id, "replacing a previous runner");
            previous.handle.abort();
        }
    }
}
