//! Domain types for the cutover orchestrator.
//!
//! These types describe environments, rollout plans, and the persisted
//! state of an in-flight rollout. All of them serialize to JSON so the
//! state store can record them verbatim.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CutoverError, CutoverResult};

/// Name of a service being rolled out (unique per state store).
pub type ServiceName = String;

/// Maximum number of health results kept on a rollout record.
pub const MAX_HEALTH_HISTORY: usize = 64;

// ── Environment ────────────────────────────────────────────────────

/// Lifecycle of a single deployable environment.
///
/// ```text
/// Pending → Starting → {Healthy | Unhealthy} → {Live | Draining} → Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Starting,
    Healthy,
    Unhealthy,
    Live,
    Draining,
    Terminated,
}

impl LifecycleState {
    /// Whether `self → next` is a legal lifecycle transition.
    ///
    /// Re-asserting the current state is always allowed. Any non-terminal
    /// state may move to `Terminated` (that is what `stop` does).
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Pending, Starting) => true,
            (Starting, Healthy | Unhealthy) => true,
            (Healthy, Live | Draining | Unhealthy) => true,
            (Unhealthy, Draining) => true,
            (Live, Draining | Unhealthy) => true,
            _ => false,
        }
    }

    /// Terminated environments cannot be revived.
    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Terminated
    }

    /// States in which a second `start` is a no-op.
    pub fn is_started(self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::Healthy | LifecycleState::Live
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Starting => "starting",
            LifecycleState::Healthy => "healthy",
            LifecycleState::Unhealthy => "unhealthy",
            LifecycleState::Live => "live",
            LifecycleState::Draining => "draining",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Where a health probe is sent for an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEndpoint {
    /// `host:port` of the environment's readiness listener.
    pub address: String,
    /// HTTP path to probe (e.g. `/healthz`).
    pub path: String,
}

impl HealthEndpoint {
    pub fn new(address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for HealthEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}{}", self.address, self.path)
    }
}

/// What the controller asks the platform to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub service: ServiceName,
    pub namespace: String,
    /// Slot name: `blue`/`green` for blue-green, a version slug otherwise.
    pub slot: String,
    /// Image tag or version being deployed.
    pub version: String,
    pub replicas: u32,
    pub endpoint: HealthEndpoint,
}

impl EnvironmentSpec {
    /// Key used by the environment manager and the router.
    pub fn key(&self) -> String {
        environment_key(&self.service, &self.slot)
    }
}

/// One deployable unit and its current lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub service: ServiceName,
    pub namespace: String,
    pub slot: String,
    pub version: String,
    pub replicas: u32,
    pub state: LifecycleState,
    pub endpoint: HealthEndpoint,
    /// Unix timestamp (seconds) when this environment was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last state change.
    pub updated_at: u64,
}

impl Environment {
    /// Build a `Pending` environment from a spec.
    pub fn from_spec(spec: EnvironmentSpec, now: u64) -> Self {
        Self {
            service: spec.service,
            namespace: spec.namespace,
            slot: spec.slot,
            version: spec.version,
            replicas: spec.replicas,
            state: LifecycleState::Pending,
            endpoint: spec.endpoint,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> String {
        environment_key(&self.service, &self.slot)
    }

    /// The spec this environment was started from, at `replicas`.
    pub fn spec(&self, replicas: u32) -> EnvironmentSpec {
        EnvironmentSpec {
            service: self.service.clone(),
            namespace: self.namespace.clone(),
            slot: self.slot.clone(),
            version: self.version.clone(),
            replicas,
            endpoint: self.endpoint.clone(),
        }
    }
}

/// `{service}/{slot}`.
pub fn environment_key(service: &str, slot: &str) -> String {
    format!("{service}/{slot}")
}

/// Turn a version string into a slot name (`v2.1.0` → `v2-1-0`).
pub fn slot_for_version(version: &str) -> String {
    let slug: String = version
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "release".to_string()
    } else {
        slug
    }
}

// ── Plans ──────────────────────────────────────────────────────────

/// How a new version replaces the stable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Two full environments, traffic cut over atomically.
    BlueGreen,
    /// Instances replaced batch by batch; traffic flips at the end.
    Rolling,
    /// Gradual weighted traffic shift with health observation per step.
    Canary,
}

impl StrategyKind {
    /// Whether traffic can be split between two environments.
    pub fn is_weighted(self) -> bool {
        self == StrategyKind::Canary
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::BlueGreen => "blue-green",
            StrategyKind::Rolling => "rolling",
            StrategyKind::Canary => "canary",
        };
        f.write_str(s)
    }
}

impl FromStr for StrategyKind {
    type Err = CutoverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blue-green" | "bluegreen" | "blue_green" | "bg" => Ok(StrategyKind::BlueGreen),
            "rolling" | "roll" => Ok(StrategyKind::Rolling),
            "canary" => Ok(StrategyKind::Canary),
            other => Err(CutoverError::InvalidPlan(format!(
                "unknown strategy '{other}' (expected blue-green, rolling, or canary)"
            ))),
        }
    }
}

/// One traffic-weight step of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightStep {
    /// Target weight (percent) of the new environment after this step.
    pub weight: u8,
    /// How long to observe the step before re-checking health.
    pub pause: Duration,
}

impl WeightStep {
    pub fn new(weight: u8, pause: Duration) -> Self {
        Self { weight, pause }
    }
}

/// Delay schedule between health-check attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Always wait the base interval.
    Fixed,
    /// Double the interval after every failure, capped at `max`.
    Exponential { max: Duration },
}

impl Backoff {
    /// Delay to wait after `failures` consecutive failed attempts.
    pub fn delay(&self, base: Duration, failures: u32) -> Duration {
        match self {
            Backoff::Fixed => base,
            Backoff::Exponential { max } => {
                let shift = failures.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(*max)
            }
        }
    }
}

/// Bounded retry parameters for health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            backoff: Backoff::Fixed,
        }
    }
}

/// Immutable description of how to roll out a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub strategy: StrategyKind,
    /// Strictly increasing weights, ending at 100.
    pub steps: Vec<WeightStep>,
    pub retry: RetryPolicy,
}

impl RolloutPlan {
    /// Build and validate a plan from bare weights sharing one pause.
    pub fn new(
        strategy: StrategyKind,
        weights: &[u32],
        pause: Duration,
        retry: RetryPolicy,
    ) -> CutoverResult<Self> {
        let mut steps = Vec::with_capacity(weights.len());
        for &w in weights {
            let weight = u8::try_from(w)
                .ok()
                .filter(|w| *w <= 100)
                .ok_or_else(|| CutoverError::InvalidWeight {
                    weight: w,
                    reason: "must be between 0 and 100".to_string(),
                })?;
            steps.push(WeightStep::new(weight, pause));
        }
        let plan = Self {
            strategy,
            steps,
            retry,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// A single atomic cutover.
    pub fn blue_green(retry: RetryPolicy) -> Self {
        Self {
            strategy: StrategyKind::BlueGreen,
            steps: vec![WeightStep::new(100, Duration::ZERO)],
            retry,
        }
    }

    /// Check the plan's structural rules.
    pub fn validate(&self) -> CutoverResult<()> {
        if self.steps.is_empty() {
            return Err(CutoverError::InvalidPlan("plan has no steps".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(CutoverError::InvalidPlan(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        let mut previous = 0u8;
        for (idx, step) in self.steps.iter().enumerate() {
            if step.weight > 100 {
                return Err(CutoverError::InvalidWeight {
                    weight: u32::from(step.weight),
                    reason: format!("step {} must be between 0 and 100", idx + 1),
                });
            }
            if step.weight <= previous {
                return Err(CutoverError::InvalidPlan(format!(
                    "step {} weight {} is not greater than {}",
                    idx + 1,
                    step.weight,
                    previous
                )));
            }
            previous = step.weight;
        }
        if previous != 100 {
            return Err(CutoverError::InvalidPlan(format!(
                "final step must reach 100, got {previous}"
            )));
        }
        if self.strategy == StrategyKind::BlueGreen && self.steps.len() != 1 {
            return Err(CutoverError::InvalidPlan(
                "blue-green switches traffic in a single step of 100".to_string(),
            ));
        }
        Ok(())
    }

    /// Steps to execute. Without a stable environment there is nothing
    /// to shift traffic away from, so only the final step remains.
    pub fn effective_steps(&self, has_stable: bool) -> Vec<WeightStep> {
        if has_stable {
            self.steps.clone()
        } else {
            self.steps.last().copied().into_iter().collect()
        }
    }

    /// Replica count of the new environment at a given weight.
    pub fn replicas_at(&self, weight: u8, total: u32) -> u32 {
        if self.strategy == StrategyKind::BlueGreen || weight >= 100 {
            return total;
        }
        if weight == 0 || total == 0 {
            return 0;
        }
        let replicas = (u64::from(total) * u64::from(weight)).div_ceil(100);
        u32::try_from(replicas).unwrap_or(total).max(1)
    }
}

// ── Health ─────────────────────────────────────────────────────────

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Unix timestamp (milliseconds) when the probe finished.
    pub timestamp: u64,
    pub success: bool,
    pub latency: Duration,
    /// 1-based attempt number within its `wait_until_healthy` call.
    pub attempt: u32,
    pub error: Option<String>,
}

// ── Rollout state ──────────────────────────────────────────────────

/// Terminal outcome of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    RolledBack,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Succeeded => "succeeded",
            Outcome::RolledBack => "rolled back",
            Outcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Phase of the rollout state machine.
///
/// ```text
/// Preparing → DeployingTarget → HealthChecking ⇄ Promoting → Cleanup → Done
///                     └──────────────┴──────────┴→ RollingBack → Done
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Preparing,
    DeployingTarget,
    HealthChecking,
    Promoting,
    RollingBack { reason: String },
    Cleanup,
    Done { outcome: Outcome },
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done { .. })
    }

    /// Whether the machine may move from `self` to `next`.
    pub fn can_advance_to(&self, next: &Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Done { .. }, _) => false,
            (RollingBack { .. }, Done { outcome }) => *outcome != Outcome::Succeeded,
            (RollingBack { .. }, _) => false,
            (_, RollingBack { .. }) => true,
            (Preparing, DeployingTarget) => true,
            (DeployingTarget, HealthChecking) => true,
            (HealthChecking, Promoting | Cleanup) => true,
            (Promoting, HealthChecking) => true,
            (Cleanup, Done { outcome }) => *outcome == Outcome::Succeeded,
            _ => false,
        }
    }

    /// Short label used in logs and the status table.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Preparing => "preparing",
            Phase::DeployingTarget => "deploying_target",
            Phase::HealthChecking => "health_checking",
            Phase::Promoting => "promoting",
            Phase::RollingBack { .. } => "rolling_back",
            Phase::Cleanup => "cleanup",
            Phase::Done { .. } => "done",
        }
    }
}

/// Snapshot recorded when rollback itself fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackDiagnostics {
    /// Last known traffic weights by environment key.
    pub weights: BTreeMap<String, u8>,
    /// Last known lifecycle state by environment key.
    pub environments: BTreeMap<String, LifecycleState>,
    /// Errors from the rollback actions that did not complete.
    pub errors: Vec<String>,
}

impl fmt::Display for RollbackDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let weights: Vec<String> = self
            .weights
            .iter()
            .map(|(k, w)| format!("{k}={w}%"))
            .collect();
        let envs: Vec<String> = self
            .environments
            .iter()
            .map(|(k, s)| format!("{k}={s}"))
            .collect();
        write!(
            f,
            "weights [{}], environments [{}], errors [{}]",
            weights.join(", "),
            envs.join(", "),
            self.errors.join("; ")
        )
    }
}

/// Durable record of one rollout, keyed by service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutState {
    pub service: ServiceName,
    pub namespace: String,
    pub version: String,
    /// Desired replica count of the fully promoted environment.
    pub replicas: u32,
    pub plan: RolloutPlan,
    pub phase: Phase,
    /// Index of the next step to apply.
    pub step: usize,
    /// Current traffic weight of the new environment.
    pub weight: u8,
    /// The environment being rolled out.
    pub active: Option<Environment>,
    /// The environment serving traffic when the rollout began.
    pub stable: Option<Environment>,
    pub health: Vec<HealthCheckResult>,
    pub outcome: Option<Outcome>,
    /// Why the rollout was rolled back, if it was.
    pub reason: Option<String>,
    pub diagnostics: Option<RollbackDiagnostics>,
    /// Unix timestamp (milliseconds) when the rollout started.
    pub started_at: u64,
    /// Unix timestamp (milliseconds) of the last persisted change.
    pub updated_at: u64,
}

impl RolloutState {
    pub fn new(
        service: &str,
        namespace: &str,
        version: &str,
        replicas: u32,
        plan: RolloutPlan,
        stable: Option<Environment>,
        now: u64,
    ) -> Self {
        Self {
            service: service.to_string(),
            namespace: namespace.to_string(),
            version: version.to_string(),
            replicas,
            plan,
            phase: Phase::Preparing,
            step: 0,
            weight: 0,
            active: None,
            stable,
            health: Vec::new(),
            outcome: None,
            reason: None,
            diagnostics: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Append health results, keeping only the newest entries.
    pub fn record_health(&mut self, results: impl IntoIterator<Item = HealthCheckResult>) {
        self.health.extend(results);
        if self.health.len() > MAX_HEALTH_HISTORY {
            let excess = self.health.len() - MAX_HEALTH_HISTORY;
            self.health.drain(..excess);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Key for the history table: `{service}:{started_at}:{version}` with
    /// the timestamp zero-padded so lexical order is chronological.
    pub fn history_key(&self) -> String {
        format!("{}:{:020}:{}", self.service, self.started_at, self.version)
    }

    /// The fatal error for a `Failed` rollout, if any.
    pub fn rollback_error(&self) -> Option<CutoverError> {
        match self.outcome {
            Some(Outcome::Failed) => Some(CutoverError::RollbackFailed {
                diagnostics: Box::new(self.diagnostics.clone().unwrap_or_default()),
            }),
            _ => None,
        }
    }
}

/// Unix timestamp in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Unix timestamp in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn canary_plan_validates() {
        let plan = RolloutPlan::new(
            StrategyKind::Canary,
            &[10, 25, 50, 100],
            Duration::from_secs(30),
            retry(),
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.steps[2].weight, 50);
    }

    #[test]
    fn plan_rejects_out_of_range_weight() {
        let err = RolloutPlan::new(StrategyKind::Canary, &[10, 150], Duration::ZERO, retry())
            .unwrap_err();
        assert!(matches!(err, CutoverError::InvalidWeight { weight: 150, .. }));
    }

    #[test]
    fn plan_rejects_non_increasing_steps() {
        let err = RolloutPlan::new(StrategyKind::Canary, &[10, 10, 100], Duration::ZERO, retry())
            .unwrap_err();
        assert!(matches!(err, CutoverError::InvalidPlan(_)));

        let err = RolloutPlan::new(StrategyKind::Canary, &[50, 20, 100], Duration::ZERO, retry())
            .unwrap_err();
        assert!(matches!(err, CutoverError::InvalidPlan(_)));
    }

    #[test]
    fn plan_must_end_at_full_weight() {
        let err = RolloutPlan::new(StrategyKind::Canary, &[10, 50], Duration::ZERO, retry())
            .unwrap_err();
        assert!(err.to_string().contains("must reach 100"));
    }

    #[test]
    fn plan_rejects_empty_and_zero_weight() {
        assert!(RolloutPlan::new(StrategyKind::Rolling, &[], Duration::ZERO, retry()).is_err());
        assert!(RolloutPlan::new(StrategyKind::Rolling, &[0, 100], Duration::ZERO, retry()).is_err());
    }

    #[test]
    fn blue_green_is_single_step() {
        let plan = RolloutPlan::blue_green(retry());
        plan.validate().unwrap();

        let err = RolloutPlan::new(StrategyKind::BlueGreen, &[50, 100], Duration::ZERO, retry())
            .unwrap_err();
        assert!(matches!(err, CutoverError::InvalidPlan(_)));
    }

    #[test]
    fn zero_attempt_policy_is_invalid() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        let err = RolloutPlan::new(StrategyKind::Canary, &[100], Duration::ZERO, policy)
            .unwrap_err();
        assert!(matches!(err, CutoverError::InvalidPlan(_)));
    }

    #[test]
    fn effective_steps_collapse_without_stable() {
        let plan =
            RolloutPlan::new(StrategyKind::Canary, &[10, 50, 100], Duration::ZERO, retry()).unwrap();
        assert_eq!(plan.effective_steps(true).len(), 3);
        let steps = plan.effective_steps(false);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].weight, 100);
    }

    #[test]
    fn replicas_scale_with_weight() {
        let plan =
            RolloutPlan::new(StrategyKind::Canary, &[10, 50, 100], Duration::ZERO, retry()).unwrap();
        assert_eq!(plan.replicas_at(10, 4), 1);
        assert_eq!(plan.replicas_at(50, 4), 2);
        assert_eq!(plan.replicas_at(60, 4), 3);
        assert_eq!(plan.replicas_at(100, 4), 4);

        let bg = RolloutPlan::blue_green(retry());
        assert_eq!(bg.replicas_at(0, 4), 4);
    }

    #[test]
    fn replicas_at_handles_huge_totals() {
        let plan =
            RolloutPlan::new(StrategyKind::Canary, &[99, 100], Duration::ZERO, retry()).unwrap();
        assert_eq!(plan.replicas_at(99, u32::MAX), 4_252_017_623);
        assert_eq!(plan.replicas_at(100, u32::MAX), u32::MAX);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            max: Duration::from_secs(10),
        };
        let base = Duration::from_secs(1);
        assert_eq!(backoff.delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff.delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff.delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff.delay(base, 5), Duration::from_secs(10));
        assert_eq!(Backoff::Fixed.delay(base, 7), base);
    }

    #[test]
    fn lifecycle_transitions() {
        use LifecycleState::*;
        assert!(Pending.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Healthy));
        assert!(Starting.can_transition_to(Unhealthy));
        assert!(Healthy.can_transition_to(Live));
        assert!(Live.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Terminated));
        assert!(Live.can_transition_to(Unhealthy));

        assert!(!Pending.can_transition_to(Live));
        assert!(!Unhealthy.can_transition_to(Live));
        assert!(!Draining.can_transition_to(Live));
        assert!(!Terminated.can_transition_to(Starting));
    }

    #[test]
    fn phase_rollback_reachable_from_every_active_phase() {
        let rollback = Phase::RollingBack {
            reason: "health".to_string(),
        };
        for phase in [
            Phase::Preparing,
            Phase::DeployingTarget,
            Phase::HealthChecking,
            Phase::Promoting,
            Phase::Cleanup,
        ] {
            assert!(phase.can_advance_to(&rollback), "{phase:?}");
        }
        assert!(!Phase::Done {
            outcome: Outcome::Succeeded
        }
        .can_advance_to(&rollback));
    }

    #[test]
    fn rollback_cannot_end_in_success() {
        let rollback = Phase::RollingBack {
            reason: "x".to_string(),
        };
        assert!(rollback.can_advance_to(&Phase::Done {
            outcome: Outcome::RolledBack
        }));
        assert!(rollback.can_advance_to(&Phase::Done {
            outcome: Outcome::Failed
        }));
        assert!(!rollback.can_advance_to(&Phase::Done {
            outcome: Outcome::Succeeded
        }));
        assert!(!rollback.can_advance_to(&Phase::Promoting));
    }

    #[test]
    fn strategy_parses_aliases() {
        assert_eq!("blue-green".parse::<StrategyKind>().unwrap(), StrategyKind::BlueGreen);
        assert_eq!("BG".parse::<StrategyKind>().unwrap(), StrategyKind::BlueGreen);
        assert_eq!("canary".parse::<StrategyKind>().unwrap(), StrategyKind::Canary);
        assert!("shadow".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn slot_slugs_versions() {
        assert_eq!(slot_for_version("v2.1.0"), "v2-1-0");
        assert_eq!(slot_for_version("registry/app:1.4"), "registry-app-1-4");
        assert_eq!(slot_for_version("..."), "release");
    }

    #[test]
    fn health_history_is_bounded() {
        let plan = RolloutPlan::blue_green(retry());
        let mut state = RolloutState::new("api", "prod", "v2", 2, plan, None, 1000);
        let results = (0..100).map(|i| HealthCheckResult {
            timestamp: i,
            success: true,
            latency: Duration::from_millis(5),
            attempt: 1,
            error: None,
        });
        state.record_health(results);
        assert_eq!(state.health.len(), MAX_HEALTH_HISTORY);
        assert_eq!(state.health.last().unwrap().timestamp, 99);
    }

    #[test]
    fn history_keys_sort_chronologically() {
        let plan = RolloutPlan::blue_green(retry());
        let a = RolloutState::new("api", "prod", "v2", 2, plan.clone(), None, 999);
        let b = RolloutState::new("api", "prod", "v3", 2, plan, None, 1000);
        assert!(a.history_key() < b.history_key());
    }
}
