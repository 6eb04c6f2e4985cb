//! Traffic routing: maps each service to weighted task sets.
//!
//! The router keeps one immutable [`TrafficAssignment`] per service behind
//! an `Arc`. A shift builds the replacement, gets it accepted by the
//! backend, then swaps the pointer; readers holding the old `Arc` keep a
//! complete view.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use cutover_core::{RetryPolicy, retry};
use cutover_state::{LifecycleState, TaskSetId};
use cutover_taskset::TaskSetManager;

use crate::backend::{BackendError, RouterBackend};
use crate::error::{RouterError, RouterResult};

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// The complete traffic map of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficAssignment {
    pub service_name: String,
    pub weights: BTreeMap<TaskSetId, f64>,
    /// Bumped on every accepted shift.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl TrafficAssignment {
    /// The task set carrying the most traffic.
    pub fn live_task_set(&self) -> Option<&TaskSetId> {
        self.weights
            .iter()
            .filter(|(_, w)| **w > 0.0)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(id, _)| id)
    }

    pub fn weight_of(&self, task_set_id: &str) -> f64 {
        self.weights.get(task_set_id).copied().unwrap_or(0.0)
    }
}

/// Owns every service's live traffic assignment.
pub struct TrafficRouter {
    backend: Arc<dyn RouterBackend>,
    task_sets: Arc<TaskSetManager>,
    retry: RetryPolicy,
    assignments: RwLock<HashMap<String, Arc<TrafficAssignment>>>,
    /// Serializes shifts so revisions stay monotonic.
    shift_lock: Mutex<()>,
}

impl TrafficRouter {
    pub fn new(
        backend: Arc<dyn RouterBackend>,
        task_sets: Arc<TaskSetManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            task_sets,
            retry,
            assignments: RwLock::new(HashMap::new()),
            shift_lock: Mutex::new(()),
        }
    }

    /// Rebuild the in-memory view from what the backend holds.
    pub async fn restore(&self) -> RouterResult<usize> {
        let loaded = retry(&self.retry, "load_assignments", BackendError::is_transient, || {
            self.backend.load()
        })
        .await
        .map_err(|e| RouterError::Backend(e.to_string()))?;

        let mut assignments = self.assignments.write().await;
        for assignment in loaded {
            assignments.insert(assignment.service_name.clone(), Arc::new(assignment));
        }
        info!(services = assignments.len(), "traffic assignments restored");
        Ok(assignments.len())
    }

    /// Replace the service's traffic map with `weights`.
    ///
    /// Every referenced task set must be steady. Returns once the backend
    /// accepted the new assignment.
    pub async fn shift(
        &self,
        service_name: &str,
        weights: BTreeMap<TaskSetId, f64>,
    ) -> RouterResult<Arc<TrafficAssignment>> {
        validate_weights(&weights)?;

        for task_set_id in weights.keys() {
            let status = self.task_sets.status(task_set_id).await?;
            if status.task_set.lifecycle_state != LifecycleState::Steady {
                return Err(RouterError::NotSteady {
                    task_set_id: task_set_id.clone(),
                    state: status.task_set.lifecycle_state,
                });
            }
            if status.stale {
                warn!(task_set = %task_set_id, "shifting on stale task set status");
            }
        }

        let _guard = self.shift_lock.lock().await;
        let revision = self
            .assignment(service_name)
            .await
            .map(|a| a.revision + 1)
            .unwrap_or(1);
        let assignment = TrafficAssignment {
            service_name: service_name.to_string(),
            weights,
            revision,
            updated_at: Utc::now(),
        };

        retry(&self.retry, "apply_assignment", BackendError::is_transient, || {
            self.backend.apply(&assignment)
        })
        .await
        .map_err(|e| RouterError::Backend(e.to_string()))?;

        let assignment = Arc::new(assignment);
        let previous = self
            .assignments
            .write()
            .await
            .insert(service_name.to_string(), assignment.clone());

        info!(
            service = %service_name,
            revision,
            weights = ?assignment.weights,
            previous = ?previous.as_ref().map(|p| &p.weights),
            "traffic shifted"
        );
        Ok(assignment)
    }

    /// Send all of the service's traffic to one task set.
    pub async fn shift_all(
        &self,
        service_name: &str,
        task_set_id: &str,
    ) -> RouterResult<Arc<TrafficAssignment>> {
        let weights = BTreeMap::from([(task_set_id.to_string(), 1.0)]);
        self.shift(service_name, weights).await
    }

    pub async fn assignment(&self, service_name: &str) -> Option<Arc<TrafficAssignment>> {
        self.assignments.read().await.get(service_name).cloned()
    }

    pub async fn live_task_set(&self, service_name: &str) -> Option<TaskSetId> {
        let assignment = self.assignment(service_name).await?;
        let live = assignment.live_task_set().cloned();
        debug!(service = %service_name, live = ?live, "resolved live task set");
        live
    }

    pub async fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.assignments.read().await.keys().cloned().collect();
        services.sort();
        services
    }
}

fn validate_weights(weights: &BTreeMap<TaskSetId, f64>) -> RouterResult<()> {
    if weights.is_empty() {
        return Err(RouterError::InvalidWeights("no task sets".to_string()));
    }
    if let Some((id, w)) = weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
        return Err(RouterError::InvalidWeights(format!("{id} has weight {w}")));
    }
    let sum: f64 = weights.values().sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(RouterError::InvalidWeights(format!("weights sum to {sum}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cutover_taskset::{MemoryPlatform, TaskSetRequest};

    use crate::backend::MemoryRouterBackend;

    struct Fixture {
        platform: Arc<MemoryPlatform>,
        task_sets: Arc<TaskSetManager>,
        backend: Arc<MemoryRouterBackend>,
        router: TrafficRouter,
    }

    fn fixture(startup_delay: Duration) -> Fixture {
        let retry = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        };
        let platform = Arc::new(MemoryPlatform::new(16, startup_delay));
        let task_sets = Arc::new(TaskSetManager::new(
            platform.clone(),
            retry.clone(),
            Duration::from_secs(2),
        ));
        let backend = Arc::new(MemoryRouterBackend::new());
        let router = TrafficRouter::new(backend.clone(), task_sets.clone(), retry);
        Fixture {
            platform,
            task_sets,
            backend,
            router,
        }
    }

    fn all_to(id: &str) -> BTreeMap<TaskSetId, f64> {
        BTreeMap::from([(id.to_string(), 1.0)])
    }

    #[tokio::test]
    async fn shift_replaces_assignment() {
        let f = fixture(Duration::ZERO);
        let blue = f.platform.seed_steady("web", "web:v1", 2).await.unwrap();
        let green = f.platform.seed_steady("web-canary", "web:v2", 2).await.unwrap();

        let first = f.router.shift("web", all_to(&blue.id)).await.unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(f.router.live_task_set("web").await, Some(blue.id.clone()));

        let second = f.router.shift_all("web", &green.id).await.unwrap();
        assert_eq!(second.revision, 2);
        assert_eq!(second.weights.len(), 1);
        assert_eq!(second.weight_of(&blue.id), 0.0);
        assert_eq!(f.router.live_task_set("web").await, Some(green.id.clone()));

        // A reader holding the old Arc still sees the full old map.
        assert_eq!(first.weight_of(&blue.id), 1.0);
        assert_eq!(f.backend.accepted("web").await.unwrap().revision, 2);
    }

    #[tokio::test]
    async fn rejects_invalid_weights() {
        let f = fixture(Duration::ZERO);
        let blue = f.platform.seed_steady("web", "web:v1", 1).await.unwrap();

        let empty = f.router.shift("web", BTreeMap::new()).await.unwrap_err();
        assert!(matches!(empty, RouterError::InvalidWeights(_)));

        let short = BTreeMap::from([(blue.id.clone(), 0.5)]);
        let err = f.router.shift("web", short).await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidWeights(_)));

        let negative = BTreeMap::from([(blue.id.clone(), 1.5), ("other".to_string(), -0.5)]);
        let err = f.router.shift("web", negative).await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidWeights(_)));
        assert!(f.router.assignment("web").await.is_none());
    }

    #[tokio::test]
    async fn split_weights_within_tolerance() {
        let f = fixture(Duration::ZERO);
        let blue = f.platform.seed_steady("web", "web:v1", 1).await.unwrap();
        let green = f.platform.seed_steady("web-b", "web:v2", 1).await.unwrap();

        let weights = BTreeMap::from([(blue.id.clone(), 0.3), (green.id.clone(), 0.7 + 1e-9)]);
        let assignment = f.router.shift("web", weights).await.unwrap();
        assert_eq!(assignment.live_task_set(), Some(&green.id));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_task_set_that_is_not_steady() {
        let f = fixture(Duration::from_secs(30));
        let green = f
            .task_sets
            .create(&TaskSetRequest {
                idempotency_key: "d1/green".to_string(),
                service_name: "web".to_string(),
                image_ref: "web:v2".to_string(),
                desired_count: 1,
                secret_refs: vec![],
            })
            .await
            .unwrap();

        let err = f.router.shift_all("web", &green.id).await.unwrap_err();
        assert!(matches!(
            err,
            RouterError::NotSteady {
                state: LifecycleState::Provisioning,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn backend_outage_is_retried_then_surfaced() {
        let f = fixture(Duration::ZERO);
        let blue = f.platform.seed_steady("web", "web:v1", 1).await.unwrap();

        f.backend.fail_next(2);
        f.router.shift_all("web", &blue.id).await.unwrap();
        assert_eq!(f.backend.applied(), 1);

        f.backend.fail_next(5);
        let err = f.router.shift_all("web", &blue.id).await.unwrap_err();
        assert!(matches!(err, RouterError::Backend(_)));
        // The failed shift left the previous assignment in place.
        assert_eq!(f.router.assignment("web").await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn restore_reads_backend() {
        let f = fixture(Duration::ZERO);
        let blue = f.platform.seed_steady("web", "web:v1", 1).await.unwrap();
        f.router.shift_all("web", &blue.id).await.unwrap();

        let fresh = TrafficRouter::new(f.backend.clone(), f.task_sets.clone(), RetryPolicy::none());
        assert_eq!(fresh.restore().await.unwrap(), 1);
        assert_eq!(fresh.live_task_set("web").await, Some(blue.id));
        assert_eq!(fresh.services().await, vec!["web".to_string()]);
    }

    #[test]
    fn assignment_serializes_weights_as_map() {
        let assignment = TrafficAssignment {
            service_name: "web".to_string(),
            weights: all_to("ts-1"),
            revision: 3,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&assignment).unwrap();
        assert_eq!(json["weights"]["ts-1"], 1.0);
        assert_eq!(json["revision"], 3);
    }
}
