//! Where accepted assignments go: a load balancer, a mesh, or memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::router::TrafficAssignment;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Worth retrying.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend rejected assignment: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// The data plane a [`TrafficRouter`](crate::TrafficRouter) programs.
///
/// `apply` returns once the backend has accepted the assignment; data
/// plane convergence may lag behind.
#[async_trait]
pub trait RouterBackend: Send + Sync {
    async fn apply(&self, assignment: &TrafficAssignment) -> Result<(), BackendError>;

    /// Assignments the backend currently holds, used to rebuild state on
    /// startup.
    async fn load(&self) -> Result<Vec<TrafficAssignment>, BackendError>;
}

/// Keeps accepted assignments in process.
#[derive(Default)]
pub struct MemoryRouterBackend {
    accepted: RwLock<HashMap<String, TrafficAssignment>>,
    faults: AtomicU32,
    applied: AtomicU32,
}

impl MemoryRouterBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` applies with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.faults.store(n, Ordering::SeqCst);
    }

    /// Successful applies so far.
    pub fn applied(&self) -> u32 {
        self.applied.load(Ordering::SeqCst)
    }

    pub async fn accepted(&self, service_name: &str) -> Option<TrafficAssignment> {
        self.accepted.read().await.get(service_name).cloned()
    }
}

#[async_trait]
impl RouterBackend for MemoryRouterBackend {
    async fn apply(&self, assignment: &TrafficAssignment) -> Result<(), BackendError> {
        let faulted = self
            .faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if faulted {
            return Err(BackendError::Unavailable("simulated outage".to_string()));
        }

        let mut accepted = self.accepted.write().await;
        if let Some(current) = accepted.get(&assignment.service_name)
            && current.revision >= assignment.revision
        {
            return Err(BackendError::Rejected(format!(
                "revision {} is not newer than {}",
                assignment.revision, current.revision
            )));
        }
        debug!(service = %assignment.service_name, revision = assignment.revision, "assignment accepted");
        accepted.insert(assignment.service_name.clone(), assignment.clone());
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<TrafficAssignment>, BackendError> {
        Ok(self.accepted.read().await.values().cloned().collect())
    }
}
