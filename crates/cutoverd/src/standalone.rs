//! Standalone mode: every component in one process.
//!
//! The daemon:
//! 1. Opens the deployment store
//! 2. Builds the in-process platform, task set manager and router
//! 3. Starts the health prober with the configured probe
//! 4. Resumes deployments left unfinished by a previous run
//! 5. Runs the reconcile sweeper and serves the REST API
//!
//! Only the deployment store survives a restart. The in-process platform
//! and router backend start empty, so a resumed deployment finds its task
//! sets gone: one still provisioning creates green again, one already
//! waiting on health times out and rolls back. Nothing is left running.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use cutover_controller::{Controller, ControllerSettings, run_sweeper};
use cutover_core::CutoverConfig;
use cutover_core::config::ProbeMode;
use cutover_health::{HealthProber, HttpProbe, InstanceProbe};
use cutover_router::{MemoryRouterBackend, TrafficRouter};
use cutover_state::DeploymentStore;
use cutover_taskset::{MemoryPlatform, TaskSetManager};

pub async fn run(config: CutoverConfig) -> anyhow::Result<()> {
    info!("Cutover daemon starting in standalone mode");

    // ── Store ──────────────────────────────────────────────────

    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.store.db_path();
    let store = DeploymentStore::open(&db_path)?;
    info!(path = ?db_path, "deployment store opened");

    // ── Infrastructure ─────────────────────────────────────────

    let platform = Arc::new(MemoryPlatform::from_config(&config.platform));
    info!(
        capacity = config.platform.capacity,
        startup_delay = ?config.platform.startup_delay,
        "in-process platform initialized"
    );

    let task_sets = Arc::new(TaskSetManager::new(
        platform.clone(),
        config.retry.clone(),
        config.task_sets.status_timeout,
    ));

    let router = Arc::new(TrafficRouter::new(
        Arc::new(MemoryRouterBackend::new()),
        task_sets.clone(),
        config.retry.clone(),
    ));
    let restored = router.restore().await?;
    info!(services = restored, "traffic router initialized");

    let probe: Arc<dyn InstanceProbe> = match config.probe.mode {
        ProbeMode::Simulated => platform.clone(),
        ProbeMode::Http => Arc::new(HttpProbe::new(&config.probe.path)),
    };
    let prober = Arc::new(HealthProber::new(task_sets.clone(), probe));
    info!(mode = ?config.probe.mode, path = %config.probe.path, "health prober initialized");

    // ── Controller ─────────────────────────────────────────────

    let controller = Arc::new(Controller::new(
        store,
        task_sets,
        router,
        prober,
        ControllerSettings::from_config(&config),
    ));
    let resumed = controller.resume().await?;
    if resumed > 0 {
        warn!(
            resumed,
            "resumed deployments reference task sets of the previous process; the in-process platform starts empty"
        );
    }
    info!(resumed, "controller started");

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_sweeper(
        controller.clone(),
        config.sweep.interval,
        shutdown_rx,
    ));

    // ── API server ─────────────────────────────────────────────

    let app = cutover_api::build_router(controller.clone());
    let addr = config.server.listen;
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = sweeper.await;
    controller.shutdown().await;

    info!("Cutover daemon stopped");
    Ok(())
}
