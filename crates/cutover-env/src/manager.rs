//! Environment lifecycle manager.
//!
//! Tracks every environment by key (`{service}/{slot}`) and enforces the
//! lifecycle graph on each state change. Backend calls are made without
//! holding the table lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use cutover_core::{
    epoch_secs, CutoverError, CutoverResult, Environment, EnvironmentSpec, LifecycleState,
};

use crate::backend::ComputeBackend;

/// Starts, stops, and tracks environments. Cheap to clone.
#[derive(Clone)]
pub struct EnvironmentManager {
    backend: Arc<dyn ComputeBackend>,
    envs: Arc<RwLock<HashMap<String, Environment>>>,
}

impl EnvironmentManager {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            backend,
            envs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start an environment.
    ///
    /// Starting an environment that is already `Starting`, `Healthy`, or
    /// `Live` is a no-op returning the current record. A terminated slot
    /// may be started again with a fresh record. If the platform refuses,
    /// the environment ends `Terminated` and the error is returned.
    pub async fn start(&self, spec: EnvironmentSpec) -> CutoverResult<Environment> {
        let key = spec.key();
        let now = epoch_secs();

        let env = {
            let mut envs = self.envs.write().expect("envs lock");
            match envs.get(&key) {
                Some(existing) if existing.state.is_started() => {
                    debug!(env = %key, state = %existing.state, "already started");
                    return Ok(existing.clone());
                }
                Some(existing)
                    if !existing.state.is_terminal()
                        && existing.state != LifecycleState::Pending =>
                {
                    return Err(CutoverError::InvalidTransition {
                        environment: key,
                        from: existing.state,
                        to: LifecycleState::Starting,
                    });
                }
                _ => {}
            }
            let mut env = Environment::from_spec(spec.clone(), now);
            env.state = LifecycleState::Starting;
            envs.insert(key.clone(), env.clone());
            env
        };

        info!(env = %key, version = %spec.version, replicas = spec.replicas, "starting environment");

        if let Err(e) = self.backend.start(&spec).await {
            warn!(env = %key, error = %e, "platform failed to start environment");
            self.set_state(&key, LifecycleState::Terminated);
            return Err(e);
        }
        Ok(env)
    }

    /// Stop an environment and mark it `Terminated`.
    ///
    /// Unknown or already terminated environments yield `NotFound`. If the
    /// platform call fails the recorded state is left unchanged.
    pub async fn stop(&self, key: &str) -> CutoverResult<()> {
        let env = self.live_record(key)?;

        info!(env = %key, "stopping environment");
        self.backend.stop(&env).await?;
        self.set_state(key, LifecycleState::Terminated);
        Ok(())
    }

    /// Change the replica count of a running environment.
    pub async fn scale(&self, key: &str, replicas: u32) -> CutoverResult<Environment> {
        let env = self.live_record(key)?;
        if env.replicas == replicas {
            return Ok(env);
        }

        info!(env = %key, from = env.replicas, to = replicas, "scaling environment");
        self.backend.scale(&env, replicas).await?;

        let mut envs = self.envs.write().expect("envs lock");
        let entry = envs
            .get_mut(key)
            .ok_or_else(|| CutoverError::NotFound(key.to_string()))?;
        entry.replicas = replicas;
        entry.updated_at = epoch_secs();
        Ok(entry.clone())
    }

    /// Record a lifecycle transition.
    ///
    /// Fails with `InvalidTransition` if the lifecycle graph forbids it.
    pub fn mark(&self, key: &str, next: LifecycleState) -> CutoverResult<Environment> {
        let mut envs = self.envs.write().expect("envs lock");
        let env = envs
            .get_mut(key)
            .ok_or_else(|| CutoverError::NotFound(key.to_string()))?;

        if !env.state.can_transition_to(next) {
            return Err(CutoverError::InvalidTransition {
                environment: key.to_string(),
                from: env.state,
                to: next,
            });
        }
        if env.state != next {
            debug!(env = %key, from = %env.state, to = %next, "lifecycle transition");
            env.state = next;
            env.updated_at = epoch_secs();
        }
        Ok(env.clone())
    }

    /// Register an environment that is already running, such as the
    /// stable environment recorded by a previous rollout. No platform
    /// call is made.
    pub fn adopt(&self, env: Environment) {
        let key = env.key();
        debug!(env = %key, state = %env.state, "adopting environment");
        self.envs.write().expect("envs lock").insert(key, env);
    }

    pub fn status(&self, key: &str) -> CutoverResult<LifecycleState> {
        self.get(key)
            .map(|env| env.state)
            .ok_or_else(|| CutoverError::NotFound(key.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<Environment> {
        self.envs.read().expect("envs lock").get(key).cloned()
    }

    /// All environments of a service, sorted by slot.
    pub fn list(&self, service: &str) -> Vec<Environment> {
        let envs = self.envs.read().expect("envs lock");
        let mut out: Vec<Environment> = envs
            .values()
            .filter(|env| env.service == service)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.slot.cmp(&b.slot));
        out
    }

    /// The record of a non-terminated environment.
    fn live_record(&self, key: &str) -> CutoverResult<Environment> {
        match self.get(key) {
            Some(env) if !env.state.is_terminal() => Ok(env),
            _ => Err(CutoverError::NotFound(key.to_string())),
        }
    }

    /// Unconditional state write for platform-driven outcomes.
    fn set_state(&self, key: &str, state: LifecycleState) {
        if let Some(env) = self.envs.write().expect("envs lock").get_mut(key) {
            env.state = state;
            env.updated_at = epoch_secs();
        }
    }
}
