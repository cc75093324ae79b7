//! Traffic router — the weight table for every service.
//!
//! Weights are whole percentages keyed by environment key. A service
//! holds at most two environments; whenever both are present their
//! weights sum to 100. Changes are pushed to the routing backend first
//! and only recorded once it accepts them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cutover_core::{CutoverError, CutoverResult};

use crate::backend::{RoutingBackend, WeightChange};

/// How traffic may be split for a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Any split between 0 and 100.
    #[default]
    Weighted,
    /// All or nothing: only 0 and 100 are accepted.
    Binary,
}

#[derive(Debug, Clone, Default)]
struct ServiceRoutes {
    mode: RoutingMode,
    weights: BTreeMap<String, u8>,
}

/// Routes traffic between environments. Cheap to clone.
#[derive(Clone)]
pub struct TrafficRouter {
    backend: Arc<dyn RoutingBackend>,
    services: Arc<RwLock<HashMap<String, ServiceRoutes>>>,
    /// Serializes backend calls so table updates land in call order.
    apply_lock: Arc<tokio::sync::Mutex<()>>,
}

impl TrafficRouter {
    pub fn new(backend: Arc<dyn RoutingBackend>) -> Self {
        Self {
            backend,
            services: Arc::new(RwLock::new(HashMap::new())),
            apply_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn set_mode(&self, service: &str, mode: RoutingMode) {
        let mut services = self.services.write().expect("services lock");
        services.entry(service.to_string()).or_default().mode = mode;
        debug!(%service, ?mode, "routing mode set");
    }

    /// Record an environment that already carries `weight` percent of
    /// traffic. No backend call is made.
    pub fn adopt(&self, service: &str, key: &str, weight: u8) -> CutoverResult<()> {
        if weight > 100 {
            return Err(invalid(u32::from(weight), "must be between 0 and 100"));
        }
        let mut services = self.services.write().expect("services lock");
        let routes = services.entry(service.to_string()).or_default();
        ensure_room(routes, key)?;
        routes.weights.insert(key.to_string(), weight);
        debug!(%service, env = %key, weight, "adopted route");
        Ok(())
    }

    /// Add an environment with zero weight. Attaching twice is a no-op.
    pub fn attach(&self, service: &str, key: &str) -> CutoverResult<()> {
        let mut services = self.services.write().expect("services lock");
        let routes = services.entry(service.to_string()).or_default();
        if routes.weights.contains_key(key) {
            return Ok(());
        }
        ensure_room(routes, key)?;
        routes.weights.insert(key.to_string(), 0);
        debug!(%service, env = %key, "attached route");
        Ok(())
    }

    /// Remove an environment from the table. It must carry no traffic.
    pub fn detach(&self, service: &str, key: &str) -> CutoverResult<()> {
        let mut services = self.services.write().expect("services lock");
        let Some(routes) = services.get_mut(service) else {
            return Err(CutoverError::NotFound(key.to_string()));
        };
        match routes.weights.get(key) {
            None => return Err(CutoverError::NotFound(key.to_string())),
            Some(&w) if w > 0 => {
                return Err(invalid(
                    u32::from(w),
                    &format!("{key} still carries traffic and cannot be detached"),
                ))
            }
            Some(_) => {}
        }
        routes.weights.remove(key);
        debug!(%service, env = %key, "detached route");
        Ok(())
    }

    /// Give `key` `weight` percent of traffic; the other environment of
    /// the service receives the complement.
    ///
    /// Out-of-range weights, partial weights in binary mode, and partial
    /// weights with a single environment are rejected with `InvalidWeight`
    /// before any backend call. If the backend fails the table is left
    /// unchanged. Returns the resulting table.
    pub async fn set_weight(
        &self,
        service: &str,
        key: &str,
        weight: u32,
    ) -> CutoverResult<BTreeMap<String, u8>> {
        self.update(service, key, weight, false).await
    }

    /// Like `set_weight`, but the whole resulting table is sent to the
    /// backend even when it matches what is recorded. Used where the
    /// recorded table may lag the routing layer, as after a crash.
    pub async fn enforce_weight(
        &self,
        service: &str,
        key: &str,
        weight: u32,
    ) -> CutoverResult<BTreeMap<String, u8>> {
        self.update(service, key, weight, true).await
    }

    async fn update(
        &self,
        service: &str,
        key: &str,
        weight: u32,
        force: bool,
    ) -> CutoverResult<BTreeMap<String, u8>> {
        if weight > 100 {
            return Err(invalid(weight, "must be between 0 and 100"));
        }
        let weight = weight as u8;

        let _guard = self.apply_lock.lock().await;

        let (current, next) = {
            let services = self.services.read().expect("services lock");
            let routes = services
                .get(service)
                .filter(|r| r.weights.contains_key(key))
                .ok_or_else(|| CutoverError::NotFound(key.to_string()))?;

            let partial = weight != 0 && weight != 100;
            if partial && routes.mode == RoutingMode::Binary {
                return Err(invalid(
                    u32::from(weight),
                    "binary routing only accepts 0 or 100",
                ));
            }

            let others: Vec<&String> = routes.weights.keys().filter(|k| *k != key).collect();
            if partial && others.is_empty() {
                return Err(invalid(
                    u32::from(weight),
                    &format!("{key} is the only environment of {service}"),
                ));
            }

            let mut next = routes.weights.clone();
            next.insert(key.to_string(), weight);
            if let Some(other) = others.first() {
                next.insert((*other).clone(), 100 - weight);
            }
            (routes.weights.clone(), next)
        };

        let baseline = if force { BTreeMap::new() } else { current };
        let changes = ordered_changes(&baseline, &next);
        if changes.is_empty() {
            return Ok(next);
        }

        self.backend.apply(service, &changes).await?;

        let mut services = self.services.write().expect("services lock");
        let routes = services.entry(service.to_string()).or_default();
        routes.weights = next.clone();
        info!(%service, env = %key, weight, table = ?next, "traffic weights updated");
        Ok(next)
    }

    /// Current weight table of a service.
    pub fn weights(&self, service: &str) -> BTreeMap<String, u8> {
        let services = self.services.read().expect("services lock");
        services
            .get(service)
            .map(|r| r.weights.clone())
            .unwrap_or_default()
    }

    pub fn weight(&self, service: &str, key: &str) -> Option<u8> {
        let services = self.services.read().expect("services lock");
        services.get(service)?.weights.get(key).copied()
    }

    /// Names of every service with routing state.
    pub fn services(&self) -> Vec<String> {
        let services = self.services.read().expect("services lock");
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }
}

fn invalid(weight: u32, reason: &str) -> CutoverError {
    CutoverError::InvalidWeight {
        weight,
        reason: reason.to_string(),
    }
}

fn ensure_room(routes: &ServiceRoutes, key: &str) -> CutoverResult<()> {
    if !routes.weights.contains_key(key) && routes.weights.len() >= 2 {
        return Err(CutoverError::InvalidPlan(format!(
            "cannot route to {key}: service already splits traffic between {:?}",
            routes.weights.keys().collect::<Vec<_>>()
        )));
    }
    Ok(())
}

/// Entries that differ, gaining environments first.
fn ordered_changes(current: &BTreeMap<String, u8>, next: &BTreeMap<String, u8>) -> Vec<WeightChange> {
    let mut changes: Vec<(bool, WeightChange)> = next
        .iter()
        .filter(|(k, w)| current.get(*k) != Some(*w))
        .map(|(k, &w)| {
            let gaining = w > current.get(k).copied().unwrap_or(0);
            (
                gaining,
                WeightChange {
                    key: k.clone(),
                    weight: w,
                },
            )
        })
        .collect();
    changes.sort_by_key(|(gaining, _)| !*gaining);
    changes.into_iter().map(|(_, c)| c).collect()
}
