//! StateStore — redb-backed persistence for rollouts.
//!
//! Provides typed operations over active rollouts, stable environments,
//! and rollout history. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for tests and dry runs).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use cutover_core::{Environment, RolloutState};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(STABLE).map_err(map_err!(Table))?;
        txn.open_table(HISTORY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Active rollouts ────────────────────────────────────────────

    /// Record a new rollout unless the service already has an active one.
    ///
    /// Returns `false` (and writes nothing) when a non-terminal rollout is
    /// already recorded. The check and the insert share one write
    /// transaction, so two processes cannot both claim a service.
    pub fn try_claim_rollout(&self, state: &RolloutState) -> StateResult<bool> {
        let value = serde_json::to_vec(state).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed = {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let in_flight = match table.get(state.service.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let existing: RolloutState =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    !existing.is_terminal()
                }
                None => false,
            };
            if !in_flight {
                table
                    .insert(state.service.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            !in_flight
        };
        if claimed {
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(service = %state.service, "rollout claimed");
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(service = %state.service, "rollout claim refused");
        }
        Ok(claimed)
    }

    /// Insert or update the active rollout for a service.
    pub fn put_rollout(&self, state: &RolloutState) -> StateResult<()> {
        let value = serde_json::to_vec(state).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            table
                .insert(state.service.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the active rollout for a service.
    pub fn get_rollout(&self, service: &str) -> StateResult<Option<RolloutState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(service).map_err(map_err!(Read))? {
            Some(guard) => {
                let state: RolloutState =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// List all active rollouts.
    pub fn list_rollouts(&self) -> StateResult<Vec<RolloutState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let state: RolloutState =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(state);
        }
        Ok(results)
    }

    /// Move a finished rollout from the active table into history.
    pub fn archive_rollout(&self, state: &RolloutState) -> StateResult<()> {
        let key = state.history_key();
        let value = serde_json::to_vec(state).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            history
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            let mut active = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            active
                .remove(state.service.as_str())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "rollout archived");
        Ok(())
    }

    /// Finished rollouts for a service, newest first.
    pub fn list_history(&self, service: &str, limit: usize) -> StateResult<Vec<RolloutState>> {
        let prefix = format!("{service}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let state: RolloutState =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(state);
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    // ── Stable environments ────────────────────────────────────────

    /// Record the environment now serving a service.
    pub fn put_stable(&self, env: &Environment) -> StateResult<()> {
        let value = serde_json::to_vec(env).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STABLE).map_err(map_err!(Table))?;
            table
                .insert(env.service.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service = %env.service, slot = %env.slot, "stable environment stored");
        Ok(())
    }

    /// Get the stable environment for a service.
    pub fn get_stable(&self, service: &str) -> StateResult<Option<Environment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STABLE).map_err(map_err!(Table))?;
        match table.get(service).map_err(map_err!(Read))? {
            Some(guard) => {
                let env: Environment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(env))
            }
            None => Ok(None),
        }
    }

    /// List every service's stable environment.
    pub fn list_stable(&self) -> StateResult<Vec<Environment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STABLE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let env: Environment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(env);
        }
        Ok(results)
    }
}
