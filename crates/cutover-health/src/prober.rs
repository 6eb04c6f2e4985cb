//! Health prober: background task that polls a task set's instances.
//!
//! `HealthProber` spawns one loop per task set. Each loop publishes a
//! [`HealthSnapshot`] per cycle into a `watch` channel; subscribers read
//! the latest value and never see a backlog.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use cutover_state::{HealthPolicy, Instance, TaskSetId};

use crate::checker::{CycleTracker, InstanceProbe, ProbeResult};

/// Verdict from one probe cycle.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HealthSnapshot {
    pub task_set_id: TaskSetId,
    pub healthy_count: u32,
    /// Instances expected in this cycle (the set's desired count).
    pub total_count: u32,
    pub consecutive_success_cycles: u32,
    /// Sequence number of the cycle that produced this snapshot, from 1.
    pub cycle: u64,
    pub observed_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Fraction of expected instances that passed.
    pub fn healthy_fraction(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        f64::from(self.healthy_count) / f64::from(self.total_count)
    }

    /// Whether this snapshot satisfies `policy`.
    pub fn meets(&self, policy: &HealthPolicy) -> bool {
        self.total_count > 0
            && self.consecutive_success_cycles >= policy.evaluation_window
            && self.healthy_fraction() + 1e-9 >= policy.min_healthy_fraction
    }

    /// Whether the cycle that produced this snapshot passed.
    pub fn cycle_passed(&self) -> bool {
        self.consecutive_success_cycles > 0
    }
}

/// What a probe cycle should look at.
#[derive(Debug, Clone, Default)]
pub struct ProbeTargetSet {
    /// Instances the set is supposed to have.
    pub expected: u32,
    /// Instances currently running.
    pub instances: Vec<Instance>,
}

/// Source of probe targets, normally the task set manager.
#[async_trait]
pub trait ProbeTargets: Send + Sync {
    async fn probe_targets(&self, task_set_id: &str) -> anyhow::Result<ProbeTargetSet>;
}

/// Per-task-set loop state.
struct ProbeSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    snapshots: watch::Receiver<Option<HealthSnapshot>>,
}

/// Runs liveness probing for every task set somebody subscribed to.
pub struct HealthProber {
    targets: Arc<dyn ProbeTargets>,
    probe: Arc<dyn InstanceProbe>,
    /// Active loops: task_set_id → slot.
    slots: Arc<RwLock<HashMap<TaskSetId, ProbeSlot>>>,
}

impl HealthProber {
    pub fn new(targets: Arc<dyn ProbeTargets>, probe: Arc<dyn InstanceProbe>) -> Self {
        Self {
            targets,
            probe,
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start probing `task_set_id` (or join the running loop) and return
    /// a receiver for its snapshots.
    pub async fn subscribe(
        &self,
        task_set_id: &str,
        policy: &HealthPolicy,
    ) -> watch::Receiver<Option<HealthSnapshot>> {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get(task_set_id) {
            if !slot.handle.is_finished() {
                return slot.snapshots.clone();
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (snapshot_tx, snapshot_rx) = watch::channel(None);

        let id = task_set_id.to_string();
        let interval = policy.probe_interval;
        let policy = policy.clone();
        let targets = self.targets.clone();
        let probe = self.probe.clone();
        let handle = tokio::spawn(async move {
            run_probe_loop(&id, &policy, targets, probe, snapshot_tx, shutdown_rx).await;
        });

        slots.insert(
            task_set_id.to_string(),
            ProbeSlot {
                handle,
                shutdown_tx,
                snapshots: snapshot_rx.clone(),
            },
        );
        info!(task_set = %task_set_id, ?interval, "health prober started");
        snapshot_rx
    }

    /// Latest snapshot for a task set, if it is being probed.
    pub async fn observe(&self, task_set_id: &str) -> Option<HealthSnapshot> {
        let slots = self.slots.read().await;
        slots
            .get(task_set_id)
            .and_then(|slot| slot.snapshots.borrow().clone())
    }

    /// Stop probing a task set.
    pub async fn unsubscribe(&self, task_set_id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.remove(task_set_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(task_set = %task_set_id, "health prober stopped");
        }
    }

    /// Stop all loops (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        for (id, slot) in slots.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(task_set = %id, "health prober stopped");
        }
        info!("all health probers stopped");
    }

    /// Task set ids with an active loop.
    pub async fn active(&self) -> Vec<TaskSetId> {
        let slots = self.slots.read().await;
        slots.keys().cloned().collect()
    }

    pub async fn is_probing(&self, task_set_id: &str) -> bool {
        let slots = self.slots.read().await;
        slots.contains_key(task_set_id)
    }
}

/// The probe loop for a single task set.
async fn run_probe_loop(
    task_set_id: &str,
    policy: &HealthPolicy,
    targets: Arc<dyn ProbeTargets>,
    probe: Arc<dyn InstanceProbe>,
    snapshots: watch::Sender<Option<HealthSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = CycleTracker::new(policy);
    let mut ticker = tokio::time::interval(policy.probe_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_expected = 0;

    debug!(task_set = %task_set_id, "probe loop starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (healthy, expected) = match targets.probe_targets(task_set_id).await {
                    Ok(set) => {
                        last_expected = set.expected;
                        let healthy = probe_all(&probe, set.instances, policy).await;
                        (healthy.min(set.expected), set.expected)
                    }
                    Err(e) => {
                        warn!(task_set = %task_set_id, error = %e, "could not list probe targets; counting cycle as failed");
                        (0, last_expected)
                    }
                };

                let consecutive = tracker.record(healthy, expected);
                let snapshot = HealthSnapshot {
                    task_set_id: task_set_id.to_string(),
                    healthy_count: healthy,
                    total_count: expected,
                    consecutive_success_cycles: consecutive,
                    cycle: tracker.cycles(),
                    observed_at: Utc::now(),
                };
                debug!(
                    task_set = %task_set_id,
                    healthy,
                    expected,
                    consecutive,
                    cycle = snapshot.cycle,
                    "probe cycle complete"
                );
                // Overwrites any unread snapshot; never waits on readers.
                snapshots.send_replace(Some(snapshot));
            }
            _ = shutdown.changed() => {
                debug!(task_set = %task_set_id, "probe loop shutting down");
                break;
            }
        }
    }
}

/// Probe every instance concurrently; returns the number that passed.
async fn probe_all(
    probe: &Arc<dyn InstanceProbe>,
    instances: Vec<Instance>,
    policy: &HealthPolicy,
) -> u32 {
    let timeout = policy.probe_timeout;
    let mut set = JoinSet::new();
    for instance in instances {
        let probe = probe.clone();
        set.spawn(async move {
            tokio::time::timeout(timeout, probe.probe(&instance, timeout))
                .await
                .unwrap_or(ProbeResult::Failed)
        });
    }

    let mut healthy = 0;
    while let Some(result) = set.join_next().await {
        if matches!(result, Ok(ProbeResult::Healthy)) {
            healthy += 1;
        }
    }
    healthy
}
