//! Rollout controller — drives the rollout state machine.
//!
//! Each phase handler performs its side effects and returns the next
//! phase; it never returns an error. Any failure becomes a transition to
//! `RollingBack` carrying the reason. Every transition is persisted
//! before the next handler runs.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use cutover_core::{
    epoch_millis, epoch_secs, slot_for_version, AbortSignal, Backoff, CutoverError,
    CutoverResult, EndpointTemplate, Environment, EnvironmentSpec, LifecycleState, Outcome,
    Phase, RollbackDiagnostics, RolloutPlan, RolloutState, StrategyKind, WeightStep,
};
use cutover_env::EnvironmentManager;
use cutover_health::{retry_with_backoff, HealthChecker, HealthReport, RetryOutcome};
use cutover_router::{RoutingMode, TrafficRouter};
use cutover_state::StateStore;

use crate::lease::LeaseRegistry;

/// Attempts per rollback action before the rollout is declared failed.
const ROLLBACK_ATTEMPTS: u32 = 3;
const ROLLBACK_INTERVAL: Duration = Duration::from_secs(1);

/// What to roll out.
#[derive(Debug, Clone)]
pub struct RolloutRequest {
    pub service: String,
    pub namespace: String,
    pub version: String,
    /// Replica count of the fully promoted environment.
    pub replicas: u32,
    pub plan: RolloutPlan,
    /// Where the new environment answers health probes.
    pub endpoint: EndpointTemplate,
}

/// Runs rollouts. Cheap to clone; clones share environments, routes,
/// the state store, and leases.
#[derive(Clone)]
pub struct RolloutController {
    envs: EnvironmentManager,
    router: TrafficRouter,
    health: HealthChecker,
    store: StateStore,
    leases: LeaseRegistry,
}

impl RolloutController {
    pub fn new(
        envs: EnvironmentManager,
        router: TrafficRouter,
        health: HealthChecker,
        store: StateStore,
    ) -> Self {
        Self {
            envs,
            router,
            health,
            store,
            leases: LeaseRegistry::new(),
        }
    }

    pub fn environments(&self) -> &EnvironmentManager {
        &self.envs
    }

    pub fn router(&self) -> &TrafficRouter {
        &self.router
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn leases(&self) -> &LeaseRegistry {
        &self.leases
    }

    /// Run a rollout to completion.
    ///
    /// Invalid plans and concurrent rollouts of the same service are
    /// rejected before anything is started. Once the rollout has begun it
    /// always reaches `Done`, and the final state is returned whatever the
    /// outcome; `RolloutState::rollback_error` gives the fatal error of a
    /// `Failed` rollout.
    pub async fn run(
        &self,
        req: RolloutRequest,
        mut abort: AbortSignal,
    ) -> CutoverResult<RolloutState> {
        let RolloutRequest {
            service,
            namespace,
            version,
            replicas,
            plan,
            endpoint,
        } = req;

        plan.validate()?;
        if replicas == 0 {
            return Err(CutoverError::InvalidPlan(
                "replicas must be at least 1".to_string(),
            ));
        }

        let _lease = self.leases.acquire(&service)?;

        let stable = self.store.get_stable(&service)?;
        let slot = target_slot(plan.strategy, &version, stable.as_ref())?;
        let target_endpoint = endpoint.resolve(&service, &namespace, &slot)?;
        let now = epoch_secs();
        let target = Environment::from_spec(
            EnvironmentSpec {
                service: service.clone(),
                namespace: namespace.clone(),
                slot,
                version: version.clone(),
                replicas,
                endpoint: target_endpoint,
            },
            now,
        );

        let mut state = RolloutState::new(
            &service,
            &namespace,
            &version,
            replicas,
            plan,
            stable,
            epoch_millis(),
        );
        state.active = Some(target);

        if !self.store.try_claim_rollout(&state)? {
            return Err(CutoverError::RolloutInProgress(service));
        }

        let weights: Vec<u8> = steps_of(&state).iter().map(|s| s.weight).collect();
        info!(
            %service,
            %version,
            strategy = %state.plan.strategy,
            ?weights,
            stable = state.stable.as_ref().map(|e| e.version.as_str()).unwrap_or("none"),
            "rollout started"
        );

        self.drive(&mut state, &mut abort).await;
        self.finish(&state);
        Ok(state)
    }

    /// Roll back a rollout left unfinished by a crashed process.
    ///
    /// The persisted record is the only source of truth: its environments
    /// are adopted as they were last recorded and the rollback phase runs
    /// exactly as it would have in the original process.
    pub async fn recover(&self, service: &str) -> CutoverResult<RolloutState> {
        let _lease = self.leases.acquire(service)?;

        let mut state = self
            .store
            .get_rollout(service)?
            .filter(|s| !s.is_terminal())
            .ok_or_else(|| {
                CutoverError::NotFound(format!("no interrupted rollout for service '{service}'"))
            })?;

        warn!(
            %service,
            phase = state.phase.name(),
            step = state.step,
            weight = state.weight,
            "recovering interrupted rollout"
        );

        self.router.set_mode(service, routing_mode(state.plan.strategy));
        if let Some(stable) = &state.stable {
            self.envs.adopt(stable.clone());
            if self.router.weight(service, &stable.key()).is_none() {
                self.router
                    .adopt(service, &stable.key(), 100 - state.weight.min(100))?;
            }
        }
        if let Some(active) = &state.active {
            let mut env = active.clone();
            // The platform may have started it before the crash.
            if env.state == LifecycleState::Pending {
                env.state = LifecycleState::Starting;
            }
            if !env.state.is_terminal() {
                let key = env.key();
                self.envs.adopt(env);
                if self.router.weight(service, &key).is_none() {
                    self.router.adopt(service, &key, state.weight)?;
                }
            }
        }

        state.phase = self.resume_phase(&state).await;
        self.persist(&mut state)?;

        self.drive(&mut state, &mut AbortSignal::never()).await;
        self.finish(&state);
        Ok(state)
    }

    /// Where a recovered rollout picks up. A rollout that reached
    /// `Cleanup` at full weight has already cut over and is finished
    /// forward; anything else is rolled back.
    async fn resume_phase(&self, state: &RolloutState) -> Phase {
        let reason = match &state.phase {
            Phase::RollingBack { reason } => return rollback(reason.clone()),
            phase => format!("recovered after interruption in {}", phase.name()),
        };
        let target = state.active.as_ref().filter(|e| !e.state.is_terminal());
        match (&state.phase, target) {
            (Phase::Cleanup, Some(target)) if state.weight == 100 => {
                let key = target.key();
                match self.router.enforce_weight(&state.service, &key, 100).await {
                    Ok(_) => {
                        info!(service = %state.service, env = %key, "finishing interrupted cleanup");
                        Phase::Cleanup
                    }
                    Err(e) => rollback(format!("{reason}: cannot confirm traffic on {key}: {e}")),
                }
            }
            _ => rollback(reason),
        }
    }

    async fn drive(&self, state: &mut RolloutState, abort: &mut AbortSignal) {
        loop {
            let next = match state.phase.clone() {
                Phase::Preparing => self.prepare(state),
                Phase::DeployingTarget => self.deploy(state).await,
                Phase::HealthChecking => self.check_health(state, abort).await,
                Phase::Promoting => self.promote(state, abort).await,
                Phase::Cleanup => self.cleanup(state).await,
                Phase::RollingBack { reason } => self.roll_back(state, &reason).await,
                Phase::Done { .. } => return,
            };
            self.advance(state, next);
        }
    }

    /// Record a phase transition and persist it. A persist failure on a
    /// forward phase turns into a rollback.
    fn advance(&self, state: &mut RolloutState, next: Phase) {
        debug_assert!(
            state.phase.can_advance_to(&next),
            "illegal transition {:?} -> {:?}",
            state.phase,
            next
        );
        info!(
            service = %state.service,
            from = state.phase.name(),
            to = next.name(),
            step = state.step,
            weight = state.weight,
            "phase transition"
        );

        if let Phase::Done { outcome } = &next {
            state.outcome = Some(*outcome);
        }
        state.phase = next;

        if let Err(e) = self.persist(state) {
            error!(service = %state.service, error = %e, "failed to persist rollout state");
            if !matches!(state.phase, Phase::RollingBack { .. } | Phase::Done { .. }) {
                state.phase = Phase::RollingBack {
                    reason: format!("failed to persist rollout state: {e}"),
                };
                if let Err(e) = self.persist(state) {
                    error!(service = %state.service, error = %e, "failed to persist rollback");
                }
            }
        }
    }

    fn persist(&self, state: &mut RolloutState) -> CutoverResult<()> {
        state.updated_at = epoch_millis();
        self.store.put_rollout(state)?;
        Ok(())
    }

    fn finish(&self, state: &RolloutState) {
        if let Err(e) = self.store.archive_rollout(state) {
            warn!(service = %state.service, error = %e, "failed to archive rollout");
        }
        let version = state.version.as_str();
        match state.outcome {
            Some(Outcome::Succeeded) => {
                info!(service = %state.service, %version, "rollout succeeded")
            }
            Some(Outcome::RolledBack) => warn!(
                service = %state.service,
                %version,
                reason = state.reason.as_deref().unwrap_or(""),
                "rollout rolled back"
            ),
            Some(Outcome::Failed) | None => error!(
                service = %state.service,
                %version,
                diagnostics = %state.diagnostics.clone().unwrap_or_default(),
                "rollout failed, manual intervention required"
            ),
        }
    }

    // ── Phase handlers ─────────────────────────────────────────────

    fn prepare(&self, state: &mut RolloutState) -> Phase {
        self.router
            .set_mode(&state.service, routing_mode(state.plan.strategy));

        if let Some(stable) = &state.stable {
            let key = stable.key();
            self.envs.adopt(stable.clone());
            if self.router.weight(&state.service, &key).is_none() {
                if let Err(e) = self.router.adopt(&state.service, &key, 100) {
                    return rollback(format!("cannot route to stable environment {key}: {e}"));
                }
            }
        }
        Phase::DeployingTarget
    }

    async fn deploy(&self, state: &mut RolloutState) -> Phase {
        let Some(target) = state.active.clone() else {
            return rollback("no target environment recorded".to_string());
        };
        let key = target.key();

        let first = steps_of(state).first().map(|s| s.weight).unwrap_or(100);
        let replicas = state.plan.replicas_at(first, state.replicas);

        match self.envs.start(target.spec(replicas)).await {
            Ok(env) => state.active = Some(env),
            Err(e) => {
                self.refresh_active(state);
                return rollback(format!("failed to start {key}: {e}"));
            }
        }

        if let Err(e) = self.router.attach(&state.service, &key) {
            return rollback(format!("cannot route to {key}: {e}"));
        }
        debug!(service = %state.service, env = %key, replicas, "target deployed");
        Phase::HealthChecking
    }

    async fn check_health(&self, state: &mut RolloutState, abort: &mut AbortSignal) -> Phase {
        let Some(target) = state.active.clone() else {
            return rollback("no target environment recorded".to_string());
        };
        let key = target.key();

        let report = self
            .health
            .wait_until_healthy(&target.endpoint, &state.plan.retry, abort)
            .await;
        info!(
            service = %state.service,
            env = %key,
            step = state.step,
            attempts = report.attempts(),
            healthy = report.is_healthy(),
            "health gate"
        );
        let HealthReport { results, outcome } = report;
        state.record_health(results);

        let next = match outcome {
            Ok(()) => match self.envs.mark(&key, LifecycleState::Healthy) {
                Ok(_) if state.step < steps_of(state).len() => Phase::Promoting,
                Ok(_) => Phase::Cleanup,
                Err(e) => rollback(e.to_string()),
            },
            Err(CutoverError::Aborted) => rollback("aborted by operator".to_string()),
            Err(e) => {
                if let Err(mark) = self.envs.mark(&key, LifecycleState::Unhealthy) {
                    debug!(env = %key, error = %mark, "could not mark environment unhealthy");
                }
                rollback(e.to_string())
            }
        };
        self.refresh_active(state);
        next
    }

    async fn promote(&self, state: &mut RolloutState, abort: &mut AbortSignal) -> Phase {
        let steps = steps_of(state);
        let Some(step) = steps.get(state.step).copied() else {
            return rollback(format!("step {} is past the end of the plan", state.step + 1));
        };
        let Some(target) = state.active.clone() else {
            return rollback("no target environment recorded".to_string());
        };
        let service = state.service.clone();
        let key = target.key();

        info!(
            %service,
            step = state.step + 1,
            of = steps.len(),
            weight = step.weight,
            "promoting"
        );

        if let Err(e) = self.apply_step(state, &key, step).await {
            self.refresh_active(state);
            return rollback(format!("step {} ({}%): {e}", state.step + 1, step.weight));
        }
        self.refresh_active(state);
        state.weight = self.router.weight(&service, &key).unwrap_or(state.weight);
        state.step += 1;

        if !step.pause.is_zero() {
            let clock = self.health.clock();
            tokio::select! {
                _ = clock.sleep(step.pause) => {}
                _ = abort.aborted() => {
                    return rollback("aborted by operator".to_string());
                }
            }
        }
        Phase::HealthChecking
    }

    /// Scale and route for one step of the plan.
    async fn apply_step(
        &self,
        state: &RolloutState,
        key: &str,
        step: WeightStep,
    ) -> CutoverResult<()> {
        let service = state.service.as_str();
        let plan = &state.plan;
        let new_replicas = plan.replicas_at(step.weight, state.replicas);

        match plan.strategy {
            StrategyKind::BlueGreen => {
                self.router
                    .set_weight(service, key, u32::from(step.weight))
                    .await?;
            }
            StrategyKind::Canary => {
                self.envs.scale(key, new_replicas).await?;
                self.router
                    .set_weight(service, key, u32::from(step.weight))
                    .await?;
            }
            StrategyKind::Rolling => {
                self.envs.scale(key, new_replicas).await?;
                if step.weight < 100 {
                    if let Some(stable) = &state.stable {
                        let replaced = plan.replicas_at(step.weight, stable.replicas);
                        let remaining = stable.replicas.saturating_sub(replaced).max(1);
                        self.envs.scale(&stable.key(), remaining).await?;
                    }
                } else {
                    self.router.set_weight(service, key, 100).await?;
                }
            }
        }
        Ok(())
    }

    async fn cleanup(&self, state: &mut RolloutState) -> Phase {
        let Some(target) = state.active.clone() else {
            return rollback("no target environment recorded".to_string());
        };
        let service = state.service.clone();
        let key = target.key();

        let promoted = match self.envs.mark(&key, LifecycleState::Live) {
            Ok(env) => env,
            Err(e) => return rollback(e.to_string()),
        };
        // Record the new stable environment before the old one goes away.
        if let Err(e) = self.store.put_stable(&promoted) {
            return rollback(format!("failed to record stable environment: {e}"));
        }
        state.active = Some(promoted);

        if let Some(stable) = state.stable.clone() {
            let old = stable.key();
            if let Err(e) = self.envs.mark(&old, LifecycleState::Draining) {
                debug!(env = %old, error = %e, "could not mark stable environment draining");
            }
            if let Err(e) = self.envs.stop(&old).await {
                warn!(
                    %service,
                    env = %old,
                    error = %e,
                    "previous environment could not be stopped; stop it manually"
                );
            }
            if let Err(e) = self.router.detach(&service, &old) {
                debug!(env = %old, error = %e, "could not detach previous environment");
            }
            if let Some(env) = self.envs.get(&old) {
                state.stable = Some(env);
            }
        }

        Phase::Done {
            outcome: Outcome::Succeeded,
        }
    }

    /// Restore the stable environment's traffic and replicas, then tear
    /// the new environment down. Each action is retried a few times; any
    /// that still fails ends the rollout as `Failed`.
    async fn roll_back(&self, state: &mut RolloutState, reason: &str) -> Phase {
        let service = state.service.clone();
        warn!(%service, %reason, step = state.step, weight = state.weight, "rolling back");
        state.reason = Some(reason.to_string());

        let stable = state.stable.clone();
        let target_key = state.active.as_ref().map(Environment::key);
        let mut errors = Vec::new();

        // Traffic first: nothing is stopped while it may still be served.
        // The full table is sent since the recorded weights may lag the
        // routing layer.
        let traffic = match (&stable, &target_key) {
            (Some(stable), _) if self.router.weight(&service, &stable.key()).is_some() => {
                Some((stable.key(), 100))
            }
            (None, Some(key)) if self.router.weight(&service, key).is_some() => {
                Some((key.clone(), 0))
            }
            _ => None,
        };
        let traffic_restored = match &traffic {
            Some((key, weight)) => {
                let (svc, key, weight) = (service.as_str(), key.as_str(), *weight);
                let result = self
                    .retry_action("restore traffic", move |_| {
                        self.router.enforce_weight(svc, key, weight)
                    })
                    .await;
                match result {
                    Ok(_) => true,
                    Err(e) => {
                        errors.push(e.to_string());
                        false
                    }
                }
            }
            None => true,
        };

        if let Some(stable) = &stable {
            let key = stable.key();
            let current = self.envs.get(&key).map(|e| e.replicas);
            if current.is_some_and(|r| r != stable.replicas) {
                let (key, replicas) = (key.as_str(), stable.replicas);
                if let Err(e) = self
                    .retry_action("restore stable replicas", move |_| {
                        self.envs.scale(key, replicas)
                    })
                    .await
                {
                    errors.push(e.to_string());
                }
            }
        }

        if let Some(stable) = stable.as_ref().filter(|_| traffic_restored) {
            let env = self.envs.get(&stable.key()).unwrap_or_else(|| stable.clone());
            if !env.state.is_terminal() {
                if let Err(e) = self.store.put_stable(&env) {
                    errors.push(format!("re-record stable environment {}: {e}", env.key()));
                }
            }
        }

        if let Some(key) = &target_key {
            if !traffic_restored {
                errors.push(format!(
                    "left {key} running because traffic could not be moved off it"
                ));
            } else if self.envs.get(key).is_some_and(|e| !e.state.is_terminal()) {
                if self.router.weight(&service, key).is_some() {
                    if let Err(e) = self.router.detach(&service, key) {
                        errors.push(format!("detach {key}: {e}"));
                    }
                }
                if let Err(e) = self.envs.mark(key, LifecycleState::Draining) {
                    debug!(env = %key, error = %e, "stopping without draining");
                }
                let key = key.as_str();
                let stopped = self
                    .retry_action("stop new environment", move |_| async move {
                        match self.envs.stop(key).await {
                            Err(CutoverError::NotFound(_)) => Ok(()),
                            other => other,
                        }
                    })
                    .await;
                if let Err(e) = stopped {
                    errors.push(e.to_string());
                }
            }
        }

        self.refresh_active(state);
        if let Some(env) = stable.as_ref().and_then(|s| self.envs.get(&s.key())) {
            state.stable = Some(env);
        }
        state.weight = target_key
            .as_deref()
            .and_then(|key| self.router.weight(&service, key))
            .unwrap_or(0);

        if errors.is_empty() {
            return Phase::Done {
                outcome: Outcome::RolledBack,
            };
        }

        let diagnostics = RollbackDiagnostics {
            weights: self.router.weights(&service),
            environments: self
                .envs
                .list(&service)
                .into_iter()
                .map(|env| (env.key(), env.state))
                .collect(),
            errors,
        };
        error!(%service, %diagnostics, "rollback failed");
        state.diagnostics = Some(diagnostics);
        Phase::Done {
            outcome: Outcome::Failed,
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Run a rollback action with a small fixed retry budget. Rollback
    /// actions ignore operator aborts.
    async fn retry_action<T, F, Fut>(&self, action: &str, op: F) -> CutoverResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = CutoverResult<T>>,
    {
        let clock = self.health.clock();
        let outcome = retry_with_backoff(
            clock.as_ref(),
            ROLLBACK_ATTEMPTS,
            ROLLBACK_INTERVAL,
            Backoff::Fixed,
            &mut AbortSignal::never(),
            op,
        )
        .await;

        match outcome {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted {
                attempts,
                mut failures,
            }
            | RetryOutcome::Aborted {
                attempts,
                mut failures,
            } => {
                let last = failures
                    .pop()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no attempt made".to_string());
                Err(CutoverError::Backend(format!(
                    "{action} failed after {attempts} attempts: {last}"
                )))
            }
        }
    }

    fn refresh_active(&self, state: &mut RolloutState) {
        if let Some(env) = state.active.as_ref().and_then(|e| self.envs.get(&e.key())) {
            state.active = Some(env);
        }
    }
}

fn rollback(reason: String) -> Phase {
    Phase::RollingBack { reason }
}

fn steps_of(state: &RolloutState) -> Vec<WeightStep> {
    state.plan.effective_steps(state.stable.is_some())
}

fn routing_mode(strategy: StrategyKind) -> RoutingMode {
    if strategy.is_weighted() {
        RoutingMode::Weighted
    } else {
        RoutingMode::Binary
    }
}

/// Slot for the new environment. Blue-green alternates `blue`/`green`;
/// the other strategies name the slot after the version.
fn target_slot(
    strategy: StrategyKind,
    version: &str,
    stable: Option<&Environment>,
) -> CutoverResult<String> {
    match strategy {
        StrategyKind::BlueGreen => {
            let slot = match stable.map(|e| e.slot.as_str()) {
                Some("blue") => "green",
                _ => "blue",
            };
            Ok(slot.to_string())
        }
        StrategyKind::Rolling | StrategyKind::Canary => {
            let slot = slot_for_version(version);
            if stable.is_some_and(|e| e.slot == slot) {
                return Err(CutoverError::InvalidPlan(format!(
                    "version {version} is already live in slot '{slot}'"
                )));
            }
            Ok(slot)
        }
    }
}
