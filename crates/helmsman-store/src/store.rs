//! DeploymentStore — redb-backed persistence for deployment documents.
//!
//! Documents are JSON-serialized into redb's `&[u8]` value column, keyed
//! by deployment id. The store supports on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::tables::DEPLOYMENTS;
use crate::types::{Deployment, Parameters, Task};

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe deployment document store backed by redb.
#[derive(Clone)]
pub struct DeploymentStore {
    db: Arc<Database>,
}

impl DeploymentStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "deployment store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory deployment store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace a deployment document.
    pub fn upsert(&self, deployment: &Deployment) -> StoreResult<()> {
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(deployment.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %deployment.id, "deployment stored");
        Ok(())
    }

    /// Get a deployment by id.
    pub fn get(&self, id: &str) -> StoreResult<Option<Deployment>> {
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

    /// List all deployments.
    pub fn list(&self) -> StoreResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(deployment);
        }
        Ok(results)
    }

    /// Delete a deployment by id. Returns true if it existed.
    pub fn delete(&self, id: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %id, existed, "deployment deleted");
        Ok(existed)
    }

    /// Merge keys into a deployment's parameter map, last writer wins
    /// per key. Read-modify-write inside a single write transaction.
    pub fn merge_parameters(&self, id: &str, update: &Parameters) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut deployment: Deployment = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StoreError::DeploymentNotFound(id.to_string())),
            };
            deployment.parameters.merge_from(update);
            let value = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %id, keys = update.0.len(), "parameters merged");
        Ok(())
    }

    /// Overwrite the sub-task with `task.task_id` in place.
    pub fn update_task(&self, id: &str, task: &Task) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut deployment: Deployment = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StoreError::DeploymentNotFound(id.to_string())),
            };
            let index = deployment.task_index(&task.task_id).ok_or_else(|| {
                StoreError::TaskNotFound {
                    deployment_id: id.to_string(),
                    task_id: task.task_id.clone(),
                }
            })?;
            deployment.tasks[index] = task.clone();
            let value = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %id, task_id = %task.task_id, status = ?task.status, "task updated");
        Ok(())
    }

    /// Deployments with any task not in a terminal status.
    pub fn find_incomplete(&self) -> StoreResult<Vec<Deployment>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|d| !d.is_complete())
            .collect())
    }

    /// Deployments with no `end` timestamp.
    pub fn find_broken(&self) -> StoreResult<Vec<Deployment>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|d| d.end.is_none())
            .collect())
    }
}
