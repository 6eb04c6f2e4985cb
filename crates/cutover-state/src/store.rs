//! DeploymentStore: redb-backed persistence for deployments.
//!
//! Every deployment is stored once under its id and never deleted;
//! terminal records stay for audit and crash-resume disambiguation. The
//! `ACTIVE` table holds the id of each service's non-terminal deployment
//! and is checked and written inside the same transaction as the record,
//! which is what makes "one active deployment per service" atomic.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe deployment store backed by redb.
#[derive(Clone)]
pub struct DeploymentStore {
    db: Arc<Database>,
}

impl DeploymentStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "deployment store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory deployment store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(ACTIVE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert a new deployment and take the service lock.
    ///
    /// Fails with `ServiceBusy` if the service already has a non-terminal
    /// deployment. The returned record carries version 1.
    pub fn create_deployment(&self, deployment: &Deployment) -> StateResult<Deployment> {
        let mut record = deployment.clone();
        record.version = 1;
        let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut active = txn.open_table(ACTIVE).map_err(map_err!(Table))?;
            let holder = active
                .get(record.service_name.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            if let Some(deployment_id) = holder {
                return Err(StateError::ServiceBusy {
                    service: record.service_name.clone(),
                    deployment_id,
                });
            }

            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if table.get(record.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Write(format!("deployment {} already exists", record.id)));
            }
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            if !record.state.is_terminal() {
                active
                    .insert(record.service_name.as_str(), record.id.as_str())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %record.id, service = %record.service_name, "deployment created");
        Ok(record)
    }

    /// Write `deployment` if its `version` still matches the stored one.
    ///
    /// On success the returned record carries the bumped version. Reaching
    /// a terminal state releases the service lock in the same transaction.
    pub fn update_deployment(&self, deployment: &Deployment) -> StateResult<Deployment> {
        let mut record = deployment.clone();
        record.version = deployment.version + 1;
        let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let current: Deployment = match table.get(record.id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(record.id.clone())),
            };
            if current.version != deployment.version {
                return Err(StateError::Conflict {
                    id: record.id.clone(),
                    expected: deployment.version,
                    found: current.version,
                });
            }
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            if record.state.is_terminal() {
                let mut active = txn.open_table(ACTIVE).map_err(map_err!(Table))?;
                let holder = active
                    .get(record.service_name.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value().to_string());
                if holder.as_deref() == Some(record.id.as_str()) {
                    active
                        .remove(record.service_name.as_str())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %record.id, state = %record.state, version = record.version, "deployment stored");
        Ok(record)
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment: Deployment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// List all deployments, oldest first.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(deployment);
        }
        results.sort_by_key(|d| d.created_at);
        Ok(results)
    }

    /// List deployments that have not reached a terminal state.
    pub fn list_active_deployments(&self) -> StateResult<Vec<Deployment>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .filter(|d| !d.state.is_terminal())
            .collect())
    }

    /// The non-terminal deployment holding a service's lock, if any.
    pub fn active_for_service(&self, service: &str) -> StateResult<Option<Deployment>> {
        let id = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let active = txn.open_table(ACTIVE).map_err(map_err!(Table))?;
            active
                .get(service)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string())
        };
        match id {
            Some(id) => self.get_deployment(&id),
            None => Ok(None),
        }
    }

    /// All deployments for one service, oldest first.
    pub fn list_for_service(&self, service: &str) -> StateResult<Vec<Deployment>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.service_name == service)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_core::HealthPolicy;

    fn test_deployment(service: &str) -> Deployment {
        Deployment::new(service, "shop/web:v2", HealthPolicy::default(), 3, vec![])
    }

    #[test]
    fn create_and_get() {
        let store = DeploymentStore::open_in_memory().unwrap();
        let created = store.create_deployment(&test_deployment("web")).unwrap();
        assert_eq!(created.version, 1);

        let fetched = store.get_deployment(&created.id).unwrap();
        assert_eq!(fetched, Some(created));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = DeploymentStore::open_in_memory().unwrap();
        assert!(store.get_deployment("nope").unwrap().is_none());
    }

    #[test]
    fn second_active_deployment_for_service_is_rejected() {
        let store = DeploymentStore::open_in_memory().unwrap();
        let first = store.create_deployment(&test_deployment("web")).unwrap();

        let err = store.create_deployment(&test_deployment("web")).unwrap_err();
        match err {
            StateError::ServiceBusy { service, deployment_id } => {
                assert_eq!(service, "web");
                assert_eq!(deployment_id, first.id);
            }
            other => panic!("expected ServiceBusy, got {other:?}"),
        }

        // Other services are independent.
        store.create_deployment(&test_deployment("api")).unwrap();
    }

    #[test]
    fn update_bumps_version() {
        let store = DeploymentStore::open_in_memory().unwrap();
        let mut d = store.create_deployment(&test_deployment("web")).unwrap();

        d.enter(DeploymentState::ProvisioningGreen);
        let d = store.update_deployment(&d).unwrap();
        assert_eq!(d.version, 2);
        assert_eq!(
            store.get_deployment(&d.id).unwrap().unwrap().state,
            DeploymentState::ProvisioningGreen
        );
    }

    #[test]
    fn stale_write_conflicts() {
        let store = DeploymentStore::open_in_memory().unwrap();
        let original = store.create_deployment(&test_deployment("web")).unwrap();

        let mut writer_a = original.clone();
        writer_a.cancel_requested = true;
        store.update_deployment(&writer_a).unwrap();

        let mut writer_b = original;
        writer_b.enter(DeploymentState::ProvisioningGreen);
        let err = store.update_deployment(&writer_b).unwrap_err();
        assert!(err.is_conflict());
        match err {
            StateError::Conflict { expected, found, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = DeploymentStore::open_in_memory().unwrap();
        let err = store.update_deployment(&test_deployment("web")).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn terminal_state_releases_service_lock() {
        let store = DeploymentStore::open_in_memory().unwrap();
        let mut d = store.create_deployment(&test_deployment("web")).unwrap();
        assert_eq!(store.active_for_service("web").unwrap().map(|d| d.id), Some(d.id.clone()));

        d.enter(DeploymentState::Failed);
        d.record_failure(FailureKind::Image, "unknown image");
        store.update_deployment(&d).unwrap();

        assert!(store.active_for_service("web").unwrap().is_none());
        assert!(store.list_active_deployments().unwrap().is_empty());

        // Archived, not deleted.
        let archived = store.get_deployment(&d.id).unwrap().unwrap();
        assert_eq!(archived.failure_kind, Some(FailureKind::Image));

        // The service accepts a new deployment.
        store.create_deployment(&test_deployment("web")).unwrap();
        assert_eq!(store.list_for_service("web").unwrap().len(), 2);
    }

    #[test]
    fn list_active_filters_terminal() {
        let store = DeploymentStore::open_in_memory().unwrap();
        store.create_deployment(&test_deployment("a")).unwrap();
        let mut b = store.create_deployment(&test_deployment("b")).unwrap();
        b.enter(DeploymentState::Completed);
        store.update_deployment(&b).unwrap();

        assert_eq!(store.list_deployments().unwrap().len(), 2);
        let active = store.list_active_deployments().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].service_name, "a");
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        let id = {
            let store = DeploymentStore::open(&db_path).unwrap();
            let mut d = store.create_deployment(&test_deployment("web")).unwrap();
            d.enter(DeploymentState::AwaitingHealth);
            store.update_deployment(&d).unwrap();
            d.id
        };

        let store = DeploymentStore::open(&db_path).unwrap();
        let d = store.get_deployment(&id).unwrap().unwrap();
        assert_eq!(d.state, DeploymentState::AwaitingHealth);
        assert_eq!(d.version, 2);
        assert_eq!(store.active_for_service("web").unwrap().map(|d| d.id), Some(id));
    }
}
