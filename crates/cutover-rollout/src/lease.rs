//! Per-service rollout lease.
//!
//! A lease is taken while a rollout is `Preparing` and released when the
//! guard drops, which happens once the rollout has reached `Done`. It
//! guards against two rollouts in one process; the state store's claim
//! guards against two processes sharing a state directory.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use cutover_core::{CutoverError, CutoverResult};

/// Set of services with a rollout in flight. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct LeaseRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `service`, or fail with `RolloutInProgress`.
    pub fn acquire(&self, service: &str) -> CutoverResult<RolloutLease> {
        let mut held = self.held.lock().expect("lease lock");
        if !held.insert(service.to_string()) {
            return Err(CutoverError::RolloutInProgress(service.to_string()));
        }
        debug!(%service, "rollout lease acquired");
        Ok(RolloutLease {
            service: service.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, service: &str) -> bool {
        self.held.lock().expect("lease lock").contains(service)
    }
}

/// Drop guard for one service's lease.
#[derive(Debug)]
pub struct RolloutLease {
    service: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for RolloutLease {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.service);
            debug!(service = %self.service, "rollout lease released");
        }
    }
}
