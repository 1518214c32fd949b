//! CoordinationStore — lock, in-progress/paused maps, awaiting sets.
//!
//! All mutations run inside a single redb write transaction, which gives
//! `register_in_progress` its atomic set-if-absent semantics. Predicates
//! are cheap read transactions suitable for polling at task boundaries.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable};
use tracing::{debug, info};

use crate::error::{CoordinationError, CoordinationResult};
use crate::queue::WorkQueue;
use crate::tables::{ENTRIES, QUEUE, QUEUE_LEASES, QUEUE_META};

macro_rules! map_err {
    ($variant:ident) => {
        |e| CoordinationError::$variant(e.to_string())
    };
}

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct CoordinationStore {
    db: Arc<Database>,
    prefix: String,
}

impl CoordinationStore {
    /// Open (or create) a persistent coordination store.
    pub fn open(path: &Path, prefix: &str) -> CoordinationResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            prefix: prefix.to_string(),
        };
        store.ensure_tables()?;
        debug!(?path, prefix, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory(prefix: &str) -> CoordinationResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            prefix: prefix.to_string(),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> CoordinationResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        txn.open_table(QUEUE).map_err(map_err!(Table))?;
        txn.open_table(QUEUE_LEASES).map_err(map_err!(Table))?;
        txn.open_table(QUEUE_META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The work queue sharing this store's database.
    pub fn queue(&self) -> WorkQueue {
        WorkQueue::new(Arc::clone(&self.db))
    }

    // ── Key layout ─────────────────────────────────────────────────

    fn lock_key(&self) -> String {
        format!("{}:lock", self.prefix)
    }

    fn in_progress_key(&self, app: &str, env: &str, region: &str) -> String {
        format!(
            "{}:deployments:in-progress:{app}-{env}-{region}",
            self.prefix
        )
    }

    fn paused_key(&self, app: &str, env: &str, region: &str) -> String {
        format!("{}:deployments:paused:{app}-{env}-{region}", self.prefix)
    }

    fn awaiting_pause_key(&self, app: &str, env: &str, region: &str) -> String {
        format!(
            "{}:deployments:awaiting-pause:{app}-{env}-{region}",
            self.prefix
        )
    }

    fn awaiting_cancel_key(&self, app: &str, env: &str, region: &str) -> String {
        format!(
            "{}:deployments:awaiting-cancel:{app}-{env}-{region}",
            self.prefix
        )
    }

    // ── Primitive entry operations ─────────────────────────────────

    fn get_string(&self, key: &str) -> CoordinationResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: String =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn contains(&self, key: &str) -> CoordinationResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        Ok(table.get(key).map_err(map_err!(Read))?.is_some())
    }

    fn put_string(&self, key: &str, value: &str) -> CoordinationResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert only if absent; true iff the entry was installed.
    fn put_string_if_absent(&self, key: &str, value: &str) -> CoordinationResult<bool> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let installed;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                installed = false;
            } else {
                table
                    .insert(key, bytes.as_slice())
                    .map_err(map_err!(Write))?;
                installed = true;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(installed)
    }

    /// Remove an entry; true iff it existed.
    fn remove(&self, key: &str) -> CoordinationResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// All entries under a key prefix, as suffix → string value.
    fn scan_prefix(&self, key_prefix: &str) -> CoordinationResult<BTreeMap<String, String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
        let mut results = BTreeMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if let Some(suffix) = key.value().strip_prefix(key_prefix) {
                let value: String =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.insert(suffix.to_string(), value);
            }
        }
        Ok(results)
    }

    // ── Global lock ────────────────────────────────────────────────

    /// Whether the advisory intake lock is held.
    pub fn locked(&self) -> CoordinationResult<bool> {
        self.contains(&self.lock_key())
    }

    pub fn set_lock(&self) -> CoordinationResult<()> {
        info!("deployment intake lock set");
        self.put_string(&self.lock_key(), "locked")
    }

    pub fn clear_lock(&self) -> CoordinationResult<bool> {
        info!("deployment intake lock cleared");
        self.remove(&self.lock_key())
    }

    // ── In-progress map ────────────────────────────────────────────

    /// Atomic set-if-absent of the in-progress mapping; true iff this
    /// call installed it. The mutual-exclusion primitive.
    pub fn register_in_progress(
        &self,
        app: &str,
        env: &str,
        region: &str,
        deployment_id: &str,
    ) -> CoordinationResult<bool> {
        let installed =
            self.put_string_if_absent(&self.in_progress_key(app, env, region), deployment_id)?;
        if installed {
            info!(app, env, region, deployment_id, "deployment registered in-progress");
        }
        Ok(installed)
    }

    /// The deployment currently in progress at these coordinates.
    pub fn in_progress(
        &self,
        app: &str,
        env: &str,
        region: &str,
    ) -> CoordinationResult<Option<String>> {
        self.get_string(&self.in_progress_key(app, env, region))
    }

    /// All in-progress entries, `app-env-region` → deployment id.
    pub fn in_progress_all(&self) -> CoordinationResult<BTreeMap<String, String>> {
        self.scan_prefix(&format!("{}:deployments:in-progress:", self.prefix))
    }

    pub fn unregister_in_progress(
        &self,
        app: &str,
        env: &str,
        region: &str,
    ) -> CoordinationResult<bool> {
        self.remove(&self.in_progress_key(app, env, region))
    }

    // ── Paused map ─────────────────────────────────────────────────

    /// Record that the deployment at these coordinates is paused.
    pub fn register_paused(
        &self,
        app: &str,
        env: &str,
        region: &str,
        deployment_id: &str,
    ) -> CoordinationResult<()> {
        info!(app, env, region, deployment_id, "deployment paused");
        self.put_string(&self.paused_key(app, env, region), deployment_id)
    }

    /// The paused deployment at these coordinates, if any.
    pub fn paused(&self, app: &str, env: &str, region: &str) -> CoordinationResult<Option<String>> {
        self.get_string(&self.paused_key(app, env, region))
    }

    /// All paused entries, `app-env-region` → deployment id.
    pub fn paused_all(&self) -> CoordinationResult<BTreeMap<String, String>> {
        self.scan_prefix(&format!("{}:deployments:paused:", self.prefix))
    }

    pub fn unregister_paused(
        &self,
        app: &str,
        env: &str,
        region: &str,
    ) -> CoordinationResult<bool> {
        self.remove(&self.paused_key(app, env, region))
    }

    // ── Awaiting-pause / awaiting-cancel sets ──────────────────────

    /// Request a pause at the next task boundary; true iff newly added.
    pub fn register_pause(&self, app: &str, env: &str, region: &str) -> CoordinationResult<bool> {
        let added = self.put_string_if_absent(&self.awaiting_pause_key(app, env, region), "")?;
        if added {
            info!(app, env, region, "pause requested");
        }
        Ok(added)
    }

    pub fn unregister_pause(&self, app: &str, env: &str, region: &str) -> CoordinationResult<bool> {
        self.remove(&self.awaiting_pause_key(app, env, region))
    }

    /// Whether a pause is awaiting the next task boundary.
    pub fn pause_registered(&self, app: &str, env: &str, region: &str) -> CoordinationResult<bool> {
        self.contains(&self.awaiting_pause_key(app, env, region))
    }

    /// Request cancellation at the next task boundary; true iff newly added.
    pub fn register_cancel(&self, app: &str, env: &str, region: &str) -> CoordinationResult<bool> {
        let added = self.put_string_if_absent(&self.awaiting_cancel_key(app, env, region), "")?;
        if added {
            info!(app, env, region, "cancellation requested");
        }
        Ok(added)
    }

    pub fn unregister_cancel(
        &self,
        app: &str,
        env: &str,
        region: &str,
    ) -> CoordinationResult<bool> {
        self.remove(&self.awaiting_cancel_key(app, env, region))
    }

    /// Whether cancellation is awaiting the next task boundary.
    pub fn cancel_registered(
        &self,
        app: &str,
        env: &str,
        region: &str,
    ) -> CoordinationResult<bool> {
        self.contains(&self.awaiting_cancel_key(app, env, region))
    }

    // ── Compound lifecycle operations ──────────────────────────────

    /// Clear every entry for a finished deployment: the in-progress
    /// mapping, the paused entry, and both awaiting sets.
    pub fn end_deployment(&self, app: &str, env: &str, region: &str) -> CoordinationResult<()> {
        let keys = [
            self.in_progress_key(app, env, region),
            self.paused_key(app, env, region),
            self.awaiting_pause_key(app, env, region),
            self.awaiting_cancel_key(app, env, region),
        ];
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(app, env, region, "deployment coordination entries cleared");
        Ok(())
    }

    /// Clear the paused entry and any pending cancellation on resume.
    pub fn resume(&self, app: &str, env: &str, region: &str) -> CoordinationResult<()> {
        let keys = [
            self.paused_key(app, env, region),
            self.awaiting_cancel_key(app, env, region),
        ];
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(app, env, region, "deployment resumed");
        Ok(())
    }

    /// Trivial round-trip probe, for health checks.
    pub fn healthy(&self) -> bool {
        self.contains(&self.lock_key()).is_ok()
    }
}
