//! In-process platform: a simulated fleet for standalone mode and tests.
//!
//! Task sets become `steady` once `startup_delay` has elapsed (measured on
//! the tokio clock, so paused-time tests advance it). Instances listen on
//! synthetic `127.0.0.1` addresses; [`MemoryPlatform`] doubles as the
//! [`InstanceProbe`] that answers for them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use cutover_core::config::PlatformConfig;
use cutover_health::{InstanceProbe, ProbeResult};
use cutover_state::{Instance, LifecycleState, TaskSet, TaskSetId};

use crate::platform::{Platform, PlatformError, TaskSetRequest};

const FIRST_PORT: u32 = 20000;

struct SimulatedSet {
    task_set: TaskSet,
    ready_at: Instant,
    /// How many instances answer probes successfully once started.
    healthy: u32,
    instances: Vec<Instance>,
}

impl SimulatedSet {
    fn started(&self) -> bool {
        Instant::now() >= self.ready_at
    }

    /// Fold the clock into the reported lifecycle and counts.
    fn snapshot(&self) -> TaskSet {
        let mut task_set = self.task_set.clone();
        let running = task_set.lifecycle_state != LifecycleState::Terminated;
        if task_set.lifecycle_state == LifecycleState::Provisioning && self.started() {
            task_set.lifecycle_state = LifecycleState::Steady;
        }
        task_set.observed_total_count = if running { self.instances.len() as u32 } else { 0 };
        task_set.observed_healthy_count = if running && self.started() {
            self.healthy.min(self.instances.len() as u32)
        } else {
            0
        };
        task_set
    }

    fn consumes_capacity(&self) -> bool {
        self.task_set.lifecycle_state != LifecycleState::Terminated
    }
}

/// A simulated container fleet with a fixed instance capacity.
pub struct MemoryPlatform {
    capacity: u32,
    startup_delay: Duration,
    sets: RwLock<HashMap<TaskSetId, SimulatedSet>>,
    rejected_images: RwLock<HashSet<String>>,
    /// Healthy instance count for sets created from an image.
    image_health: RwLock<HashMap<String, u32>>,
    next_port: AtomicU32,
    faults: AtomicU32,
    create_calls: AtomicU32,
}

impl MemoryPlatform {
    pub fn new(capacity: u32, startup_delay: Duration) -> Self {
        Self {
            capacity,
            startup_delay,
            sets: RwLock::new(HashMap::new()),
            rejected_images: RwLock::new(HashSet::new()),
            image_health: RwLock::new(HashMap::new()),
            next_port: AtomicU32::new(FIRST_PORT),
            faults: AtomicU32::new(0),
            create_calls: AtomicU32::new(0),
        }
    }

    pub fn from_config(config: &PlatformConfig) -> Self {
        Self::new(config.capacity, config.startup_delay)
    }

    /// Make every future task set for `image_ref` unresolvable.
    pub async fn reject_image(&self, image_ref: &str) {
        self.rejected_images.write().await.insert(image_ref.to_string());
    }

    /// Cap the healthy instances of sets created from `image_ref`.
    pub async fn set_image_health(&self, image_ref: &str, healthy: u32) {
        self.image_health
            .write()
            .await
            .insert(image_ref.to_string(), healthy);
    }

    /// Change how many of a set's instances answer probes successfully.
    pub async fn set_healthy(&self, task_set_id: &str, healthy: u32) -> Result<(), PlatformError> {
        let mut sets = self.sets.write().await;
        let set = sets
            .get_mut(task_set_id)
            .ok_or_else(|| PlatformError::NotFound(task_set_id.to_string()))?;
        debug!(task_set = %task_set_id, healthy, "simulated health changed");
        set.healthy = healthy;
        Ok(())
    }

    /// Fail the next `n` platform calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.faults.store(n, Ordering::SeqCst);
    }

    /// Start a steady set outside any deployment, as if deployed earlier.
    pub async fn seed_steady(
        &self,
        service_name: &str,
        image_ref: &str,
        desired_count: u32,
    ) -> Result<TaskSet, PlatformError> {
        let request = TaskSetRequest {
            idempotency_key: format!("seed/{service_name}"),
            service_name: service_name.to_string(),
            image_ref: image_ref.to_string(),
            desired_count,
            secret_refs: Vec::new(),
        };
        let task_set = self.provision(&request, Duration::ZERO).await?;
        Ok(task_set)
    }

    /// Every task set ever created, including terminated ones.
    pub async fn task_set_count(&self) -> usize {
        self.sets.read().await.len()
    }

    pub async fn task_sets(&self) -> Vec<TaskSet> {
        let sets = self.sets.read().await;
        let mut all: Vec<TaskSet> = sets.values().map(SimulatedSet::snapshot).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Instances currently reserved by non-terminated sets.
    pub async fn used_capacity(&self) -> u64 {
        let sets = self.sets.read().await;
        Self::used(&sets)
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn used(sets: &HashMap<TaskSetId, SimulatedSet>) -> u64 {
        sets.values()
            .filter(|s| s.consumes_capacity())
            .map(|s| u64::from(s.task_set.desired_count))
            .sum()
    }

    fn inject_fault(&self, call: &str) -> Result<(), PlatformError> {
        let taken = self
            .faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(PlatformError::Unavailable(format!("{call}: simulated outage"))),
            Err(_) => Ok(()),
        }
    }

    fn instances_for(&self, task_set_id: &str, count: u32, from: usize) -> Vec<Instance> {
        (from..from + count as usize)
            .map(|n| {
                let port = self.next_port.fetch_add(1, Ordering::SeqCst);
                Instance {
                    id: format!("{task_set_id}-{n}"),
                    task_set_id: task_set_id.to_string(),
                    address: format!("127.0.0.1:{port}"),
                }
            })
            .collect()
    }

    async fn provision(
        &self,
        request: &TaskSetRequest,
        startup_delay: Duration,
    ) -> Result<TaskSet, PlatformError> {
        if self.rejected_images.read().await.contains(&request.image_ref) {
            return Err(PlatformError::Image(request.image_ref.clone()));
        }
        let healthy = self
            .image_health
            .read()
            .await
            .get(&request.image_ref)
            .copied()
            .unwrap_or(request.desired_count);

        let mut sets = self.sets.write().await;
        let used = Self::used(&sets);
        // Widened so an oversized request cannot wrap past the check.
        if used + u64::from(request.desired_count) > u64::from(self.capacity) {
            return Err(PlatformError::Capacity(format!(
                "{} instances requested, {} of {} in use",
                request.desired_count, used, self.capacity
            )));
        }

        let id = format!("ts-{}", uuid::Uuid::new_v4().simple());
        let task_set = TaskSet {
            id: id.clone(),
            service_name: request.service_name.clone(),
            image_ref: request.image_ref.clone(),
            idempotency_key: request.idempotency_key.clone(),
            desired_count: request.desired_count,
            observed_healthy_count: 0,
            observed_total_count: 0,
            lifecycle_state: LifecycleState::Provisioning,
            secret_refs: request.secret_refs.clone(),
            created_at: Utc::now(),
        };
        let set = SimulatedSet {
            instances: self.instances_for(&id, request.desired_count, 0),
            task_set,
            ready_at: Instant::now() + startup_delay,
            healthy,
        };
        let snapshot = set.snapshot();
        sets.insert(id.clone(), set);

        info!(
            task_set = %id,
            service = %request.service_name,
            image = %request.image_ref,
            count = request.desired_count,
            "simulated task set provisioned"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn create_task_set(&self, request: &TaskSetRequest) -> Result<TaskSet, PlatformError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.inject_fault("create_task_set")?;
        self.provision(request, self.startup_delay).await
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<TaskSet>, PlatformError> {
        self.inject_fault("find_by_key")?;
        let sets = self.sets.read().await;
        Ok(sets
            .values()
            .filter(|s| s.consumes_capacity())
            .find(|s| s.task_set.idempotency_key == idempotency_key)
            .map(SimulatedSet::snapshot))
    }

    async fn describe(&self, task_set_id: &str) -> Result<TaskSet, PlatformError> {
        self.inject_fault("describe")?;
        self.sets
            .read()
            .await
            .get(task_set_id)
            .map(SimulatedSet::snapshot)
            .ok_or_else(|| PlatformError::NotFound(task_set_id.to_string()))
    }

    async fn instances(&self, task_set_id: &str) -> Result<Vec<Instance>, PlatformError> {
        self.inject_fault("instances")?;
        self.sets
            .read()
            .await
            .get(task_set_id)
            .map(|s| s.instances.clone())
            .ok_or_else(|| PlatformError::NotFound(task_set_id.to_string()))
    }

    async fn scale(&self, task_set_id: &str, desired_count: u32) -> Result<(), PlatformError> {
        self.inject_fault("scale")?;
        let mut sets = self.sets.write().await;
        let used = Self::used(&sets);
        let set = sets
            .get(task_set_id)
            .filter(|s| s.consumes_capacity())
            .ok_or_else(|| PlatformError::NotFound(task_set_id.to_string()))?;
        let current = set.task_set.desired_count;
        if desired_count > current
            && used + u64::from(desired_count - current) > u64::from(self.capacity)
        {
            return Err(PlatformError::Capacity(format!(
                "scaling to {desired_count} exceeds capacity {}",
                self.capacity
            )));
        }

        let existing = set.instances.len();
        let extra = if desired_count as usize > existing {
            self.instances_for(task_set_id, desired_count - existing as u32, existing)
        } else {
            Vec::new()
        };
        if let Some(set) = sets.get_mut(task_set_id) {
            set.instances.truncate(desired_count as usize);
            set.instances.extend(extra);
            set.task_set.desired_count = desired_count;
            if set.healthy == current {
                set.healthy = desired_count;
            }
        }
        Ok(())
    }

    async fn drain(&self, task_set_id: &str) -> Result<(), PlatformError> {
        self.inject_fault("drain")?;
        let mut sets = self.sets.write().await;
        let set = sets
            .get_mut(task_set_id)
            .ok_or_else(|| PlatformError::NotFound(task_set_id.to_string()))?;
        if set.task_set.lifecycle_state != LifecycleState::Terminated {
            set.task_set.lifecycle_state = LifecycleState::Draining;
        }
        Ok(())
    }

    async fn remove(&self, task_set_id: &str) -> Result<(), PlatformError> {
        self.inject_fault("remove")?;
        let mut sets = self.sets.write().await;
        let set = sets
            .get_mut(task_set_id)
            .ok_or_else(|| PlatformError::NotFound(task_set_id.to_string()))?;
        set.task_set.lifecycle_state = LifecycleState::Terminated;
        set.instances.clear();
        info!(task_set = %task_set_id, "simulated task set removed");
        Ok(())
    }
}

#[async_trait]
impl InstanceProbe for MemoryPlatform {
    async fn probe(&self, instance: &Instance, _timeout: Duration) -> ProbeResult {
        let sets = self.sets.read().await;
        let Some(set) = sets.get(&instance.task_set_id) else {
            return ProbeResult::Failed;
        };
        let Some(position) = set.instances.iter().position(|i| i.id == instance.id) else {
            return ProbeResult::Failed;
        };
        if !set.started() {
            return ProbeResult::Failed;
        }
        if (position as u32) < set.healthy {
            ProbeResult::Healthy
        } else {
            ProbeResult::Unhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str, image: &str, count: u32) -> TaskSetRequest {
        TaskSetRequest {
            idempotency_key: key.to_string(),
            service_name: "web".to_string(),
            image_ref: image.to_string(),
            desired_count: count,
            secret_refs: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_steady_after_startup_delay() {
        let platform = MemoryPlatform::new(8, Duration::from_secs(2));
        let ts = platform
            .create_task_set(&request("d/green", "web:v2", 2))
            .await
            .unwrap();
        assert_eq!(ts.lifecycle_state, LifecycleState::Provisioning);

        let instance = platform.instances(&ts.id).await.unwrap()[0].clone();
        assert_eq!(platform.probe(&instance, Duration::from_secs(1)).await, ProbeResult::Failed);

        tokio::time::advance(Duration::from_secs(3)).await;
        let ts = platform.describe(&ts.id).await.unwrap();
        assert_eq!(ts.lifecycle_state, LifecycleState::Steady);
        assert_eq!(ts.observed_healthy_count, 2);
        assert_eq!(platform.probe(&instance, Duration::from_secs(1)).await, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn image_health_limits_healthy_instances() {
        let platform = MemoryPlatform::new(8, Duration::ZERO);
        platform.set_image_health("web:v2", 2).await;
        let ts = platform
            .create_task_set(&request("d/green", "web:v2", 3))
            .await
            .unwrap();

        let instances = platform.instances(&ts.id).await.unwrap();
        let mut healthy = 0;
        for instance in &instances {
            if platform.probe(instance, Duration::from_secs(1)).await.is_healthy() {
                healthy += 1;
            }
        }
        assert_eq!(healthy, 2);

        platform.set_healthy(&ts.id, 3).await.unwrap();
        let last = instances.last().unwrap();
        assert_eq!(platform.probe(last, Duration::from_secs(1)).await, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn oversized_request_is_a_capacity_error() {
        let platform = MemoryPlatform::new(8, Duration::ZERO);
        platform.seed_steady("web", "web:v1", 2).await.unwrap();

        let err = platform
            .create_task_set(&request("d/green", "web:v2", u32::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Capacity(_)));
        assert_eq!(platform.used_capacity().await, 2);
    }

    #[tokio::test]
    async fn capacity_is_released_on_remove() {
        let platform = MemoryPlatform::new(4, Duration::ZERO);
        let blue = platform.seed_steady("web", "web:v1", 3).await.unwrap();
        assert!(blue.is_live());

        let err = platform
            .create_task_set(&request("d/green", "web:v2", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Capacity(_)));

        platform.drain(&blue.id).await.unwrap();
        platform.remove(&blue.id).await.unwrap();
        assert_eq!(platform.used_capacity().await, 0);
        platform
            .create_task_set(&request("d/green", "web:v2", 3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn find_by_key_skips_terminated_sets() {
        let platform = MemoryPlatform::new(4, Duration::ZERO);
        let ts = platform
            .create_task_set(&request("d/green", "web:v2", 1))
            .await
            .unwrap();
        assert_eq!(platform.find_by_key("d/green").await.unwrap().map(|t| t.id), Some(ts.id.clone()));

        platform.remove(&ts.id).await.unwrap();
        assert!(platform.find_by_key("d/green").await.unwrap().is_none());
        assert_eq!(
            platform.describe(&ts.id).await.unwrap().lifecycle_state,
            LifecycleState::Terminated
        );
    }

    #[tokio::test]
    async fn faults_are_consumed() {
        let platform = MemoryPlatform::new(4, Duration::ZERO);
        platform.fail_next(1);
        assert!(platform.describe("x").await.unwrap_err().is_transient());
        assert!(matches!(
            platform.describe("x").await,
            Err(PlatformError::NotFound(_))
        ));
    }
}
