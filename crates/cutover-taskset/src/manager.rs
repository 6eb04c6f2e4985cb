//! Task set manager: maps idempotency keys to platform task sets.
//!
//! The `TaskSetManager` is the single path to the platform:
//! - Creates task sets at most once per idempotency key
//! - Terminates (drain, then remove) and tolerates repeats
//! - Serves bounded-time status backed by a last-known cache
//! - Supplies the health prober with expected instances

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use cutover_core::{ImageRef, RetryPolicy, retry};
use cutover_health::{ProbeTargetSet, ProbeTargets};
use cutover_state::{LifecycleState, TaskSet, TaskSetId};

use crate::error::{TaskSetError, TaskSetResult};
use crate::platform::{Platform, PlatformError, TaskSetRequest};

/// A task set as last seen, and whether that sighting is current.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSetStatus {
    pub task_set: TaskSet,
    /// `true` when the platform did not answer in time and the cached
    /// copy was served instead.
    pub stale: bool,
}

/// Owns every platform call made on behalf of deployments.
pub struct TaskSetManager {
    platform: Arc<dyn Platform>,
    retry: RetryPolicy,
    status_timeout: Duration,
    /// Idempotency key → task set id.
    keys: RwLock<HashMap<String, TaskSetId>>,
    /// Task set id → last known description.
    cache: RwLock<HashMap<TaskSetId, TaskSet>>,
    /// One lock per idempotency key in flight; a key is never provisioned
    /// twice concurrently while other keys proceed in parallel.
    create_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskSetManager {
    pub fn new(platform: Arc<dyn Platform>, retry: RetryPolicy, status_timeout: Duration) -> Self {
        Self {
            platform,
            retry,
            status_timeout,
            keys: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            create_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a task set, or return the one already created for
    /// `request.idempotency_key`.
    ///
    /// The image reference is validated before any platform call.
    /// `Capacity` and `Image` failures are returned without retrying.
    pub async fn create(&self, request: &TaskSetRequest) -> TaskSetResult<TaskSet> {
        ImageRef::parse(&request.image_ref).map_err(|e| TaskSetError::Image(e.to_string()))?;
        if request.desired_count == 0 {
            return Err(TaskSetError::Capacity(
                "desired_count must be at least 1".to_string(),
            ));
        }

        let key_lock = self.key_lock(&request.idempotency_key).await;
        let guard = key_lock.lock().await;
        let created = self.create_locked(request).await;
        drop(guard);
        self.release_key_lock(&request.idempotency_key, key_lock).await;
        created
    }

    async fn create_locked(&self, request: &TaskSetRequest) -> TaskSetResult<TaskSet> {
        // Fast path: the key was resolved earlier in this process.
        let known = self.keys.read().await.get(&request.idempotency_key).cloned();
        if let Some(id) = known {
            match self.describe_with_retry(&id).await {
                Ok(task_set) if task_set.lifecycle_state != LifecycleState::Terminated => {
                    debug!(key = %request.idempotency_key, task_set = %id, "task set already exists");
                    self.remember(&task_set).await;
                    return Ok(task_set);
                }
                Ok(_) | Err(TaskSetError::NotFound(_)) => {
                    warn!(key = %request.idempotency_key, task_set = %id, "cached task set vanished, recreating");
                    self.keys.write().await.remove(&request.idempotency_key);
                }
                Err(e) => return Err(e),
            }
        }

        let platform = &self.platform;
        let task_set = retry(
            &self.retry,
            "create_task_set",
            PlatformError::is_transient,
            || async move {
                // The platform's own key lookup covers creates made before a restart.
                match platform.find_by_key(&request.idempotency_key).await {
                    Ok(Some(existing)) => Ok(existing),
                    Ok(None) => platform.create_task_set(request).await,
                    Err(e) => Err(e),
                }
            },
        )
        .await?;

        info!(
            key = %request.idempotency_key,
            task_set = %task_set.id,
            service = %request.service_name,
            image = %request.image_ref,
            desired = request.desired_count,
            "task set created"
        );
        self.remember(&task_set).await;
        Ok(task_set)
    }

    /// Look up the task set created under `idempotency_key`, if any.
    pub async fn find_by_key(&self, idempotency_key: &str) -> TaskSetResult<Option<TaskSet>> {
        let found = retry(
            &self.retry,
            "find_task_set",
            PlatformError::is_transient,
            || self.platform.find_by_key(idempotency_key),
        )
        .await?;
        if let Some(task_set) = &found {
            self.remember(task_set).await;
        }
        Ok(found)
    }

    /// Drain then remove a task set. Unknown or already removed sets are a
    /// no-op.
    pub async fn terminate(&self, task_set_id: &str) -> TaskSetResult<()> {
        if let Some(cached) = self.cache.read().await.get(task_set_id)
            && cached.lifecycle_state == LifecycleState::Terminated
        {
            debug!(task_set = %task_set_id, "task set already terminated");
            return Ok(());
        }

        let drained = retry(&self.retry, "drain_task_set", PlatformError::is_transient, || {
            self.platform.drain(task_set_id)
        })
        .await;
        match drained {
            Ok(()) => self.set_cached_state(task_set_id, LifecycleState::Draining).await,
            Err(PlatformError::NotFound(_)) => {
                debug!(task_set = %task_set_id, "task set gone before drain");
                self.set_cached_state(task_set_id, LifecycleState::Terminated).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let removed = retry(&self.retry, "remove_task_set", PlatformError::is_transient, || {
            self.platform.remove(task_set_id)
        })
        .await;
        match removed {
            Ok(()) | Err(PlatformError::NotFound(_)) => {
                self.set_cached_state(task_set_id, LifecycleState::Terminated).await;
                info!(task_set = %task_set_id, "task set terminated");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current status, bounded by the status timeout.
    ///
    /// A slow or transiently failing platform yields the cached copy with
    /// `stale = true`. A set the platform no longer knows but this manager
    /// has seen is reported as terminated.
    pub async fn status(&self, task_set_id: &str) -> TaskSetResult<TaskSetStatus> {
        let outcome =
            tokio::time::timeout(self.status_timeout, self.platform.describe(task_set_id)).await;

        match outcome {
            Ok(Ok(task_set)) => {
                self.remember(&task_set).await;
                Ok(TaskSetStatus {
                    task_set,
                    stale: false,
                })
            }
            Ok(Err(PlatformError::NotFound(_))) => {
                let mut cache = self.cache.write().await;
                match cache.get_mut(task_set_id) {
                    Some(cached) => {
                        cached.lifecycle_state = LifecycleState::Terminated;
                        Ok(TaskSetStatus {
                            task_set: cached.clone(),
                            stale: false,
                        })
                    }
                    None => Err(TaskSetError::NotFound(task_set_id.to_string())),
                }
            }
            Ok(Err(e)) if !e.is_transient() => Err(e.into()),
            Ok(Err(e)) => self.cached_status(task_set_id, e.to_string()).await,
            Err(_) => {
                self.cached_status(task_set_id, format!("status timed out after {:?}", self.status_timeout))
                    .await
            }
        }
    }

    pub async fn scale(&self, task_set_id: &str, desired_count: u32) -> TaskSetResult<()> {
        retry(&self.retry, "scale_task_set", PlatformError::is_transient, || {
            self.platform.scale(task_set_id, desired_count)
        })
        .await?;
        if let Some(cached) = self.cache.write().await.get_mut(task_set_id) {
            cached.desired_count = desired_count;
        }
        info!(task_set = %task_set_id, desired = desired_count, "task set scaled");
        Ok(())
    }

    /// Instances the platform reports as running for the set.
    pub async fn live_count(&self, task_set_id: &str) -> TaskSetResult<u32> {
        let instances = retry(&self.retry, "list_instances", PlatformError::is_transient, || {
            self.platform.instances(task_set_id)
        })
        .await?;
        Ok(instances.len() as u32)
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.create_locks
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    async fn release_key_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.create_locks.lock().await;
        // The map and `lock` are the only holders: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    async fn describe_with_retry(&self, task_set_id: &str) -> TaskSetResult<TaskSet> {
        let task_set = retry(&self.retry, "describe_task_set", PlatformError::is_transient, || {
            self.platform.describe(task_set_id)
        })
        .await?;
        Ok(task_set)
    }

    async fn cached_status(&self, task_set_id: &str, reason: String) -> TaskSetResult<TaskSetStatus> {
        match self.cache.read().await.get(task_set_id) {
            Some(cached) => {
                warn!(task_set = %task_set_id, %reason, "serving stale task set status");
                Ok(TaskSetStatus {
                    task_set: cached.clone(),
                    stale: true,
                })
            }
            None => Err(TaskSetError::Platform(reason)),
        }
    }

    async fn remember(&self, task_set: &TaskSet) {
        self.keys
            .write()
            .await
            .insert(task_set.idempotency_key.clone(), task_set.id.clone());
        self.cache
            .write()
            .await
            .insert(task_set.id.clone(), task_set.clone());
    }

    async fn set_cached_state(&self, task_set_id: &str, state: LifecycleState) {
        if let Some(cached) = self.cache.write().await.get_mut(task_set_id) {
            cached.lifecycle_state = state;
        }
    }
}

#[async_trait]
impl ProbeTargets for TaskSetManager {
    async fn probe_targets(&self, task_set_id: &str) -> anyhow::Result<ProbeTargetSet> {
        let status = self.status(task_set_id).await?;
        let instances = tokio::time::timeout(self.status_timeout, self.platform.instances(task_set_id))
            .await
            .map_err(|_| {
                TaskSetError::Platform(format!(
                    "instance listing timed out after {:?}",
                    self.status_timeout
                ))
            })?
            .map_err(TaskSetError::from)?;
        Ok(ProbeTargetSet {
            expected: status.task_set.desired_count,
            instances,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use cutover_state::Instance;

    use crate::memory::MemoryPlatform;

    fn request(key: &str, image: &str, count: u32) -> TaskSetRequest {
        TaskSetRequest {
            idempotency_key: key.to_string(),
            service_name: "web".to_string(),
            image_ref: image.to_string(),
            desired_count: count,
            secret_refs: vec!["DB_PASSWORD".to_string()],
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    fn manager(platform: Arc<MemoryPlatform>) -> TaskSetManager {
        TaskSetManager::new(platform, fast_retry(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let platform = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        let mgr = manager(platform.clone());

        let a = mgr.create(&request("d1/green", "shop/web:v2", 3)).await.unwrap();
        let b = mgr.create(&request("d1/green", "shop/web:v2", 3)).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(platform.task_set_count().await, 1);
        assert_eq!(a.secret_refs, vec!["DB_PASSWORD".to_string()]);
    }

    #[tokio::test]
    async fn create_survives_manager_restart() {
        let platform = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        let first = manager(platform.clone())
            .create(&request("d1/green", "shop/web:v2", 2))
            .await
            .unwrap();

        // A fresh manager has an empty cache; the platform lookup finds it.
        let second = manager(platform.clone())
            .create(&request("d1/green", "shop/web:v2", 2))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(platform.task_set_count().await, 1);
    }

    #[tokio::test]
    async fn malformed_image_rejected_before_platform() {
        let platform = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        let mgr = manager(platform.clone());

        let err = mgr.create(&request("d1/green", "Not An Image!", 1)).await.unwrap_err();
        assert!(matches!(err, TaskSetError::Image(_)));
        assert_eq!(platform.task_set_count().await, 0);
    }

    #[tokio::test]
    async fn capacity_and_image_errors_are_not_retried() {
        let platform = Arc::new(MemoryPlatform::new(2, Duration::ZERO));
        let mgr = manager(platform.clone());

        let err = mgr.create(&request("d1/green", "shop/web:v2", 3)).await.unwrap_err();
        assert!(matches!(err, TaskSetError::Capacity(_)));

        platform.reject_image("shop/web:broken").await;
        let err = mgr.create(&request("d2/green", "shop/web:broken", 1)).await.unwrap_err();
        assert!(matches!(err, TaskSetError::Image(_)));
        assert_eq!(platform.create_calls(), 2);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let platform = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        platform.fail_next(2);
        let mgr = manager(platform.clone());

        let ts = mgr.create(&request("d1/green", "shop/web:v2", 1)).await.unwrap();
        assert_eq!(platform.task_set_count().await, 1);
        assert_eq!(ts.desired_count, 1);
    }

    #[tokio::test]
    async fn transient_errors_exhaust_budget() {
        let platform = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        platform.fail_next(10);
        let mgr = manager(platform.clone());

        let err = mgr.create(&request("d1/green", "shop/web:v2", 1)).await.unwrap_err();
        assert!(matches!(err, TaskSetError::Platform(_)));
        assert_eq!(platform.task_set_count().await, 0);
    }

    #[tokio::test]
    async fn terminate_is_repeatable() {
        let platform = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        let mgr = manager(platform.clone());
        let ts = mgr.create(&request("d1/green", "shop/web:v2", 2)).await.unwrap();

        mgr.terminate(&ts.id).await.unwrap();
        mgr.terminate(&ts.id).await.unwrap();
        mgr.terminate("never-existed").await.unwrap();

        let status = mgr.status(&ts.id).await.unwrap();
        assert_eq!(status.task_set.lifecycle_state, LifecycleState::Terminated);
        assert_eq!(platform.used_capacity().await, 0);
    }

    #[tokio::test]
    async fn status_reports_steady_after_startup() {
        let platform = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        let mgr = manager(platform.clone());
        let ts = mgr.create(&request("d1/green", "shop/web:v2", 2)).await.unwrap();

        let status = mgr.status(&ts.id).await.unwrap();
        assert!(!status.stale);
        assert!(status.task_set.is_live());
        assert_eq!(mgr.live_count(&ts.id).await.unwrap(), 2);
    }

    /// Wraps a platform and makes selected calls hang once enabled.
    struct Stalling {
        inner: Arc<MemoryPlatform>,
        describe: AtomicBool,
        instances: AtomicBool,
        /// Creates for this service never return.
        create_for: Option<String>,
    }

    impl Stalling {
        fn new(inner: Arc<MemoryPlatform>) -> Self {
            Self {
                inner,
                describe: AtomicBool::new(false),
                instances: AtomicBool::new(false),
                create_for: None,
            }
        }
    }

    #[async_trait]
    impl Platform for Stalling {
        async fn create_task_set(&self, request: &TaskSetRequest) -> Result<TaskSet, PlatformError> {
            if self.create_for.as_deref() == Some(request.service_name.as_str()) {
                std::future::pending::<()>().await;
            }
            self.inner.create_task_set(request).await
        }
        async fn find_by_key(&self, key: &str) -> Result<Option<TaskSet>, PlatformError> {
            self.inner.find_by_key(key).await
        }
        async fn describe(&self, id: &str) -> Result<TaskSet, PlatformError> {
            if self.describe.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.describe(id).await
        }
        async fn instances(&self, id: &str) -> Result<Vec<Instance>, PlatformError> {
            if self.instances.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.instances(id).await
        }
        async fn scale(&self, id: &str, count: u32) -> Result<(), PlatformError> {
            self.inner.scale(id, count).await
        }
        async fn drain(&self, id: &str) -> Result<(), PlatformError> {
            self.inner.drain(id).await
        }
        async fn remove(&self, id: &str) -> Result<(), PlatformError> {
            self.inner.remove(id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn status_timeout_serves_stale_cache() {
        let inner = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        let slow = Arc::new(Stalling::new(inner));
        let mgr = TaskSetManager::new(slow.clone(), fast_retry(), Duration::from_millis(200));

        let ts = mgr.create(&request("d1/green", "shop/web:v2", 1)).await.unwrap();
        slow.describe.store(true, Ordering::SeqCst);

        let status = mgr.status(&ts.id).await.unwrap();
        assert!(status.stale);
        assert_eq!(status.task_set.id, ts.id);

        let err = mgr.status("unknown").await.unwrap_err();
        assert!(matches!(err, TaskSetError::Platform(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_create_does_not_block_other_services() {
        let inner = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        let stalling = Stalling {
            create_for: Some("web".to_string()),
            ..Stalling::new(inner.clone())
        };
        let mgr = Arc::new(TaskSetManager::new(
            Arc::new(stalling),
            fast_retry(),
            Duration::from_secs(2),
        ));

        let stuck = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.create(&request("d1/green", "shop/web:v2", 1)).await })
        };
        tokio::task::yield_now().await;

        let mut other = request("d2/green", "shop/api:v2", 1);
        other.service_name = "api".to_string();
        let created = tokio::time::timeout(Duration::from_secs(5), mgr.create(&other))
            .await
            .expect("create for another service waited on a stuck one")
            .unwrap();
        assert_eq!(created.service_name, "api");
        assert!(!stuck.is_finished());
        stuck.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn hung_instance_listing_fails_the_health_cycle() {
        let inner = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        let slow = Arc::new(Stalling::new(inner));
        let mgr = TaskSetManager::new(slow.clone(), fast_retry(), Duration::from_millis(200));
        let ts = mgr.create(&request("d1/green", "shop/web:v2", 2)).await.unwrap();

        slow.instances.store(true, Ordering::SeqCst);
        let err = tokio::time::timeout(Duration::from_secs(5), mgr.probe_targets(&ts.id))
            .await
            .expect("probe_targets hung on the platform")
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn scale_updates_desired_count() {
        let platform = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        let mgr = manager(platform.clone());
        let ts = mgr.create(&request("d1/green", "shop/web:v2", 1)).await.unwrap();

        mgr.scale(&ts.id, 4).await.unwrap();
        let status = mgr.status(&ts.id).await.unwrap();
        assert_eq!(status.task_set.desired_count, 4);
        assert_eq!(mgr.live_count(&ts.id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn probe_targets_expect_desired_count() {
        let platform = Arc::new(MemoryPlatform::new(16, Duration::ZERO));
        let mgr = manager(platform.clone());
        let ts = mgr.create(&request("d1/green", "shop/web:v2", 3)).await.unwrap();

        let targets = mgr.probe_targets(&ts.id).await.unwrap();
        assert_eq!(targets.expected, 3);
        assert_eq!(targets.instances.len(), 3);
        assert!(targets.instances.iter().all(|i| i.task_set_id == ts.id));
    }
}
