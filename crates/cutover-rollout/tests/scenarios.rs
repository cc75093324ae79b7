//! End-to-end rollout scenarios against in-memory backends.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use cutover_core::{
    abort_pair, AbortSignal, Backoff, CutoverError, EndpointTemplate, Environment,
    EnvironmentSpec, HealthEndpoint, LifecycleState, Outcome, Phase, RetryPolicy, RolloutPlan,
    RolloutState, StrategyKind, WeightStep,
};
use cutover_env::{ComputeOp, EnvironmentManager, MemoryCompute};
use cutover_health::{HealthChecker, Probe, ProbeResult, ScriptedProbe, StaticProbe, TokioClock};
use cutover_health::probe::ProbeFuture;
use cutover_rollout::{RolloutController, RolloutRequest};
use cutover_router::{MemoryRouting, TrafficRouter};
use cutover_state::StateStore;

struct Harness {
    controller: RolloutController,
    compute: Arc<MemoryCompute>,
    routing: Arc<MemoryRouting>,
}

fn harness(probe: Arc<dyn Probe>) -> Harness {
    harness_with_store(probe, StateStore::open_in_memory().unwrap())
}

fn harness_with_store(probe: Arc<dyn Probe>, store: StateStore) -> Harness {
    assemble(probe, store, Arc::new(MemoryRouting::new()))
}

fn assemble(probe: Arc<dyn Probe>, store: StateStore, routing: Arc<MemoryRouting>) -> Harness {
    let compute = Arc::new(MemoryCompute::new());
    let controller = RolloutController::new(
        EnvironmentManager::new(compute.clone()),
        TrafficRouter::new(routing.clone()),
        HealthChecker::new(probe, Arc::new(TokioClock)),
        store,
    );
    Harness {
        controller,
        compute,
        routing,
    }
}

fn healthy() -> Arc<dyn Probe> {
    Arc::new(StaticProbe::healthy())
}

fn retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        interval: Duration::from_secs(1),
        timeout: Duration::from_secs(1),
        backoff: Backoff::Fixed,
    }
}

fn plan(strategy: StrategyKind, weights: &[u32], pause: Duration) -> RolloutPlan {
    RolloutPlan::new(strategy, weights, pause, retry()).unwrap()
}

fn request(service: &str, version: &str, plan: RolloutPlan) -> RolloutRequest {
    RolloutRequest {
        service: service.to_string(),
        namespace: "prod".to_string(),
        version: version.to_string(),
        replicas: 4,
        plan,
        endpoint: EndpointTemplate::new("{service}-{slot}.{namespace}:8080", "/healthz"),
    }
}

/// Record a live stable environment as a previous rollout would have.
fn seed_stable(h: &Harness, service: &str, slot: &str, version: &str) -> Environment {
    let mut env = Environment::from_spec(
        EnvironmentSpec {
            service: service.to_string(),
            namespace: "prod".to_string(),
            slot: slot.to_string(),
            version: version.to_string(),
            replicas: 4,
            endpoint: HealthEndpoint::new(format!("{service}-{slot}.prod:8080"), "/healthz"),
        },
        0,
    );
    env.state = LifecycleState::Live;
    h.controller.store().put_stable(&env).unwrap();
    env
}

fn status(h: &Harness, key: &str) -> LifecycleState {
    h.controller.environments().status(key).unwrap()
}

fn weights(pairs: &[(&str, u8)]) -> BTreeMap<String, u8> {
    pairs.iter().map(|(k, w)| (k.to_string(), *w)).collect()
}

/// Weights the routing layer was asked to give one environment, in order.
fn applied_to(h: &Harness, key: &str) -> Vec<u8> {
    h.routing
        .applied()
        .into_iter()
        .flat_map(|(_, changes)| changes)
        .filter(|c| c.key == key)
        .map(|c| c.weight)
        .collect()
}

// ── Blue-green ─────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_blue_green_cuts_over() {
    let h = harness(healthy());
    seed_stable(&h, "api", "blue", "v1");

    let state = h
        .controller
        .run(
            request("api", "v2", RolloutPlan::blue_green(retry())),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::Succeeded));
    assert_eq!(state.phase, Phase::Done { outcome: Outcome::Succeeded });
    assert_eq!(state.weight, 100);

    let observed = h.routing.observed();
    assert_eq!(observed["api/blue"], 0);
    assert_eq!(observed["api/green"], 100);
    assert_eq!(h.controller.router().weights("api"), weights(&[("api/green", 100)]));

    assert_eq!(status(&h, "api/blue"), LifecycleState::Terminated);
    assert_eq!(status(&h, "api/green"), LifecycleState::Live);

    let stable = h.controller.store().get_stable("api").unwrap().unwrap();
    assert_eq!(stable.slot, "green");
    assert_eq!(stable.version, "v2");
    assert!(h.controller.store().get_rollout("api").unwrap().is_none());

    let history = h.controller.store().list_history("api", 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, Some(Outcome::Succeeded));
}

#[tokio::test]
async fn blue_green_alternates_slots_across_rollouts() {
    let h = harness(healthy());

    let first = h
        .controller
        .run(
            request("api", "v1", RolloutPlan::blue_green(retry())),
            AbortSignal::never(),
        )
        .await
        .unwrap();
    assert_eq!(first.outcome, Some(Outcome::Succeeded));
    assert_eq!(first.active.as_ref().unwrap().slot, "blue");
    assert!(first.stable.is_none());

    let second = h
        .controller
        .run(
            request("api", "v2", RolloutPlan::blue_green(retry())),
            AbortSignal::never(),
        )
        .await
        .unwrap();
    assert_eq!(second.outcome, Some(Outcome::Succeeded));
    assert_eq!(second.active.as_ref().unwrap().slot, "green");
    assert_eq!(second.stable.as_ref().unwrap().state, LifecycleState::Terminated);

    assert_eq!(h.controller.router().weights("api"), weights(&[("api/green", 100)]));
    assert_eq!(h.controller.store().list_history("api", 10).unwrap().len(), 2);
}

// ── Canary ─────────────────────────────────────────────────────────

#[tokio::test]
async fn canary_promotes_through_every_step() {
    let h = harness(healthy());
    seed_stable(&h, "api", "v1", "v1");

    let state = h
        .controller
        .run(
            request(
                "api",
                "v2",
                plan(StrategyKind::Canary, &[10, 25, 50, 100], Duration::ZERO),
            ),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::Succeeded));
    assert_eq!(state.step, 4);
    assert_eq!(applied_to(&h, "api/v2"), vec![10, 25, 50, 100]);
    assert_eq!(applied_to(&h, "api/v1"), vec![90, 75, 50, 0]);

    // Initial check plus one per step.
    assert_eq!(state.health.len(), 5);
    assert!(state.health.iter().all(|r| r.success));

    let starts = h.compute.calls_of(ComputeOp::Start);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].replicas, 1);
    let scales: Vec<u32> = h
        .compute
        .calls_of(ComputeOp::Scale)
        .into_iter()
        .map(|c| c.replicas)
        .collect();
    assert_eq!(scales, vec![2, 4]);

    assert_eq!(status(&h, "api/v1"), LifecycleState::Terminated);
    assert_eq!(status(&h, "api/v2"), LifecycleState::Live);
}

#[tokio::test]
async fn scenario_b_canary_failure_at_50_rolls_back() {
    // Healthy after deploy, at 10% and at 25%; failing from 50% on.
    let probe = Arc::new(ScriptedProbe::healthy_then_failing(3));
    let h = harness(probe.clone());
    seed_stable(&h, "api", "v1", "v1");

    let state = h
        .controller
        .run(
            request(
                "api",
                "v2",
                plan(StrategyKind::Canary, &[10, 25, 50, 100], Duration::ZERO),
            ),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::RolledBack));
    assert_eq!(state.step, 3);
    assert_eq!(state.weight, 0);
    assert!(state.reason.as_deref().unwrap().contains("timed out"));
    assert_eq!(probe.calls(), 4);

    let observed = h.routing.observed();
    assert_eq!(observed["api/v1"], 100);
    assert_eq!(observed["api/v2"], 0);
    assert!(!applied_to(&h, "api/v2").contains(&100));
    assert_eq!(h.controller.router().weights("api"), weights(&[("api/v1", 100)]));

    assert_eq!(status(&h, "api/v2"), LifecycleState::Terminated);
    assert_eq!(status(&h, "api/v1"), LifecycleState::Live);

    // The stable record is untouched.
    let stable = h.controller.store().get_stable("api").unwrap().unwrap();
    assert_eq!(stable.version, "v1");
    let history = h.controller.store().list_history("api", 1).unwrap();
    assert_eq!(history[0].outcome, Some(Outcome::RolledBack));
}

#[tokio::test]
async fn failure_at_any_step_ends_at_full_stable_weight() {
    let steps = [10, 25, 50, 100];
    for healthy_checks in 0..=steps.len() {
        let h = harness(Arc::new(ScriptedProbe::healthy_then_failing(healthy_checks)));
        seed_stable(&h, "api", "v1", "v1");

        let state = h
            .controller
            .run(
                request("api", "v2", plan(StrategyKind::Canary, &steps, Duration::ZERO)),
                AbortSignal::never(),
            )
            .await
            .unwrap();

        assert_eq!(state.outcome, Some(Outcome::RolledBack), "k={healthy_checks}");
        assert_eq!(state.step, healthy_checks, "k={healthy_checks}");
        assert_eq!(
            h.controller.router().weights("api"),
            weights(&[("api/v1", 100)]),
            "k={healthy_checks}"
        );
        if healthy_checks > 0 {
            assert_eq!(h.routing.observed()["api/v2"], 0, "k={healthy_checks}");
        }
        assert_eq!(status(&h, "api/v2"), LifecycleState::Terminated);
    }
}

#[tokio::test(start_paused = true)]
async fn first_canary_without_stable_goes_straight_to_full_weight() {
    let h = harness(healthy());

    let state = h
        .controller
        .run(
            request(
                "api",
                "v1",
                plan(StrategyKind::Canary, &[10, 50, 100], Duration::from_secs(30)),
            ),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::Succeeded));
    assert_eq!(state.step, 1);
    assert_eq!(applied_to(&h, "api/v1"), vec![100]);
    assert_eq!(h.compute.calls_of(ComputeOp::Start)[0].replicas, 4);
}

// ── Rolling ────────────────────────────────────────────────────────

#[tokio::test]
async fn rolling_replaces_replicas_then_flips_traffic() {
    let h = harness(healthy());
    seed_stable(&h, "api", "v1", "v1");

    let state = h
        .controller
        .run(
            request("api", "v2", plan(StrategyKind::Rolling, &[50, 100], Duration::ZERO)),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::Succeeded));

    // Traffic moves once, all or nothing.
    assert_eq!(h.routing.applied().len(), 1);
    assert_eq!(applied_to(&h, "api/v2"), vec![100]);
    assert_eq!(applied_to(&h, "api/v1"), vec![0]);

    let scales: Vec<(String, u32)> = h
        .compute
        .calls_of(ComputeOp::Scale)
        .into_iter()
        .map(|c| (c.key, c.replicas))
        .collect();
    assert_eq!(
        scales,
        vec![("api/v1".to_string(), 2), ("api/v2".to_string(), 4)]
    );
    assert_eq!(status(&h, "api/v1"), LifecycleState::Terminated);
}

#[tokio::test]
async fn rolling_failure_restores_stable_replicas() {
    let h = harness(Arc::new(ScriptedProbe::healthy_then_failing(1)));
    seed_stable(&h, "api", "v1", "v1");

    let state = h
        .controller
        .run(
            request("api", "v2", plan(StrategyKind::Rolling, &[50, 100], Duration::ZERO)),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::RolledBack));
    // Traffic never moved; rollback only re-asserts it.
    assert_eq!(applied_to(&h, "api/v2"), vec![0]);
    assert_eq!(applied_to(&h, "api/v1"), vec![100]);

    let stable_scales: Vec<u32> = h
        .compute
        .calls_of(ComputeOp::Scale)
        .into_iter()
        .filter(|c| c.key == "api/v1")
        .map(|c| c.replicas)
        .collect();
    assert_eq!(stable_scales, vec![2, 4]);
    assert_eq!(
        h.controller.environments().get("api/v1").unwrap().replicas,
        4
    );
    assert_eq!(status(&h, "api/v2"), LifecycleState::Terminated);
}

// ── Failures inside the machine ────────────────────────────────────

#[tokio::test]
async fn routing_failure_triggers_rollback() {
    let h = harness(healthy());
    seed_stable(&h, "api", "v1", "v1");
    h.routing.fail(1);

    let state = h
        .controller
        .run(
            request("api", "v2", plan(StrategyKind::Canary, &[10, 100], Duration::ZERO)),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::RolledBack));
    assert!(state.reason.unwrap().contains("injected routing failure"));
    assert_eq!(h.controller.router().weights("api"), weights(&[("api/v1", 100)]));
    assert_eq!(h.routing.observed()["api/v1"], 100);
    assert_eq!(status(&h, "api/v2"), LifecycleState::Terminated);
}

/// Passes the first check, then takes the routing layer down with it.
struct RoutingOutage {
    routing: Arc<MemoryRouting>,
    calls: AtomicU32,
}

impl Probe for RoutingOutage {
    fn probe<'a>(&'a self, _endpoint: &'a HealthEndpoint) -> ProbeFuture<'a> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let result = if call == 1 {
            ProbeResult::Healthy
        } else {
            self.routing.fail_always();
            ProbeResult::Unhealthy { status: 503 }
        };
        Box::pin(async move { result })
    }
}

#[tokio::test(start_paused = true)]
async fn unreachable_routing_during_rollback_fails_and_keeps_target() {
    let routing = Arc::new(MemoryRouting::new());
    let probe = Arc::new(RoutingOutage {
        routing: routing.clone(),
        calls: AtomicU32::new(0),
    });
    let h = assemble(probe, StateStore::open_in_memory().unwrap(), routing);
    seed_stable(&h, "api", "v1", "v1");

    let state = h
        .controller
        .run(
            request(
                "api",
                "v2",
                plan(StrategyKind::Canary, &[10, 50, 100], Duration::ZERO),
            ),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::Failed));
    assert_eq!(state.weight, 10);

    let diagnostics = state.diagnostics.clone().unwrap();
    assert_eq!(
        diagnostics.weights,
        weights(&[("api/v1", 90), ("api/v2", 10)])
    );
    assert!(diagnostics.errors[0].contains("restore traffic"));
    assert!(diagnostics.errors[1].contains("left api/v2 running"));

    // The new environment still serves traffic, so it is not stopped.
    assert!(h.compute.calls_of(ComputeOp::Stop).is_empty());
    assert_eq!(status(&h, "api/v2"), LifecycleState::Unhealthy);
    let stable = h.controller.store().get_stable("api").unwrap().unwrap();
    assert_eq!(stable.version, "v1");
    assert!(matches!(
        state.rollback_error(),
        Some(CutoverError::RollbackFailed { .. })
    ));
}

#[tokio::test]
async fn start_failure_rolls_back_without_stopping_anything() {
    let h = harness(healthy());
    seed_stable(&h, "api", "v1", "v1");
    h.compute.fail_always(ComputeOp::Start, "api/v2");

    let state = h
        .controller
        .run(
            request("api", "v2", plan(StrategyKind::Canary, &[10, 100], Duration::ZERO)),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::RolledBack));
    assert!(h.compute.calls_of(ComputeOp::Stop).is_empty());
    assert_eq!(status(&h, "api/v1"), LifecycleState::Live);
}

#[tokio::test(start_paused = true)]
async fn failed_rollback_reports_diagnostics() {
    let h = harness(Arc::new(ScriptedProbe::healthy_then_failing(0)));
    seed_stable(&h, "api", "v1", "v1");
    h.compute.fail_always(ComputeOp::Stop, "api/v2");

    let state = h
        .controller
        .run(
            request("api", "v2", plan(StrategyKind::Canary, &[10, 100], Duration::ZERO)),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::Failed));
    // Every stop attempt was made.
    assert_eq!(h.compute.calls_of(ComputeOp::Stop).len(), 3);

    let diagnostics = state.diagnostics.clone().unwrap();
    assert_eq!(diagnostics.weights["api/v1"], 100);
    assert_eq!(diagnostics.environments["api/v2"], LifecycleState::Draining);
    assert!(diagnostics.errors[0].contains("stop new environment"));

    match state.rollback_error() {
        Some(CutoverError::RollbackFailed { diagnostics }) => {
            assert!(!diagnostics.errors.is_empty())
        }
        other => panic!("expected RollbackFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_plan_is_rejected_before_any_work() {
    let h = harness(healthy());
    let bad = RolloutPlan {
        strategy: StrategyKind::Canary,
        steps: vec![
            WeightStep::new(50, Duration::ZERO),
            WeightStep::new(20, Duration::ZERO),
            WeightStep::new(100, Duration::ZERO),
        ],
        retry: retry(),
    };

    let err = h
        .controller
        .run(request("api", "v2", bad), AbortSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, CutoverError::InvalidPlan(_)));
    assert!(h.compute.calls().is_empty());
    assert!(h.controller.store().get_rollout("api").unwrap().is_none());
}

// ── Abort ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn abort_during_step_pause_rolls_back() {
    let h = harness(healthy());
    seed_stable(&h, "api", "v1", "v1");
    let (handle, signal) = abort_pair();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(45)).await;
        handle.abort();
    });

    let state = h
        .controller
        .run(
            request(
                "api",
                "v2",
                plan(StrategyKind::Canary, &[10, 50, 100], Duration::from_secs(30)),
            ),
            signal,
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::RolledBack));
    assert!(state.reason.unwrap().contains("aborted"));
    assert_eq!(applied_to(&h, "api/v2"), vec![10, 50, 0]);
    assert_eq!(h.controller.router().weights("api"), weights(&[("api/v1", 100)]));
}

#[tokio::test]
async fn already_aborted_rollout_never_takes_traffic() {
    let h = harness(healthy());
    seed_stable(&h, "api", "v1", "v1");
    let (handle, signal) = abort_pair();
    handle.abort();

    let state = h
        .controller
        .run(
            request("api", "v2", plan(StrategyKind::Canary, &[10, 100], Duration::ZERO)),
            signal,
        )
        .await
        .unwrap();

    assert_eq!(state.outcome, Some(Outcome::RolledBack));
    assert_eq!(applied_to(&h, "api/v2"), vec![0]);
    assert_eq!(status(&h, "api/v2"), LifecycleState::Terminated);
}

// ── Concurrency ────────────────────────────────────────────────────

/// Holds every probe until released.
struct GatedProbe {
    entered: Notify,
    release: Notify,
}

impl Probe for GatedProbe {
    fn probe<'a>(&'a self, _endpoint: &'a HealthEndpoint) -> ProbeFuture<'a> {
        Box::pin(async move {
            self.entered.notify_one();
            self.release.notified().await;
            ProbeResult::Healthy
        })
    }
}

#[tokio::test]
async fn second_rollout_for_same_service_is_rejected() {
    let probe = Arc::new(GatedProbe {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let h = harness(probe.clone());
    seed_stable(&h, "api", "v1", "v1");

    let blue_green = RolloutPlan::blue_green(RetryPolicy {
        timeout: Duration::from_secs(60),
        ..retry()
    });

    let controller = h.controller.clone();
    let first = tokio::spawn({
        let plan = blue_green.clone();
        async move {
            controller
                .run(request("api", "v2", plan), AbortSignal::never())
                .await
        }
    });

    probe.entered.notified().await;

    let err = h
        .controller
        .run(request("api", "v3", blue_green.clone()), AbortSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, CutoverError::RolloutInProgress(ref s) if s == "api"));

    // A second process sharing the state store is refused by the claim.
    let other = harness_with_store(healthy(), h.controller.store().clone());
    let err = other
        .controller
        .run(request("api", "v3", blue_green), AbortSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, CutoverError::RolloutInProgress(_)));
    assert!(other.compute.calls().is_empty());

    let in_flight = h.controller.store().get_rollout("api").unwrap().unwrap();
    assert_eq!(in_flight.version, "v2");
    assert_eq!(in_flight.phase, Phase::HealthChecking);

    // Initial check, then the check after the cutover.
    probe.release.notify_one();
    probe.entered.notified().await;
    probe.release.notify_one();

    let state = first.await.unwrap().unwrap();
    assert_eq!(state.outcome, Some(Outcome::Succeeded));
    assert_eq!(state.version, "v2");
    assert!(!h.controller.leases().is_held("api"));
}

#[tokio::test]
async fn independent_services_roll_out_concurrently() {
    let h = harness(healthy());
    seed_stable(&h, "api", "blue", "v1");
    seed_stable(&h, "web", "blue", "v1");

    let (api, web) = tokio::join!(
        h.controller.run(
            request("api", "v2", RolloutPlan::blue_green(retry())),
            AbortSignal::never()
        ),
        h.controller.run(
            request("web", "v2", RolloutPlan::blue_green(retry())),
            AbortSignal::never()
        ),
    );

    assert_eq!(api.unwrap().outcome, Some(Outcome::Succeeded));
    assert_eq!(web.unwrap().outcome, Some(Outcome::Succeeded));
    assert_eq!(h.controller.router().weights("web"), weights(&[("web/green", 100)]));
}

// ── Environments ───────────────────────────────────────────────────

#[tokio::test]
async fn stopping_a_terminated_environment_is_not_found() {
    let h = harness(healthy());
    seed_stable(&h, "api", "blue", "v1");
    h.controller
        .run(
            request("api", "v2", RolloutPlan::blue_green(retry())),
            AbortSignal::never(),
        )
        .await
        .unwrap();

    let stops_before = h.compute.calls_of(ComputeOp::Stop).len();
    let err = h.controller.environments().stop("api/blue").await.unwrap_err();
    assert!(matches!(err, CutoverError::NotFound(_)));
    assert_eq!(status(&h, "api/blue"), LifecycleState::Terminated);
    assert_eq!(h.compute.calls_of(ComputeOp::Stop).len(), stops_before);
}

// ── Recovery ───────────────────────────────────────────────────────

#[tokio::test]
async fn recover_rolls_back_interrupted_rollout() {
    let store = StateStore::open_in_memory().unwrap();

    // What a process killed mid-canary leaves behind.
    let crashed = harness_with_store(healthy(), store.clone());
    let stable = seed_stable(&crashed, "api", "v1", "v1");
    let mut active = Environment::from_spec(stable.spec(1), 0);
    active.slot = "v2".to_string();
    active.version = "v2".to_string();
    active.state = LifecycleState::Healthy;
    let mut state = RolloutState::new(
        "api",
        "prod",
        "v2",
        4,
        plan(StrategyKind::Canary, &[25, 100], Duration::ZERO),
        Some(stable),
        1_000,
    );
    state.phase = Phase::Promoting;
    state.step = 1;
    state.weight = 25;
    state.active = Some(active);
    store.put_rollout(&state).unwrap();

    let h = harness_with_store(healthy(), store.clone());
    let recovered = h.controller.recover("api").await.unwrap();

    assert_eq!(recovered.outcome, Some(Outcome::RolledBack));
    assert!(recovered.reason.unwrap().contains("promoting"));
    assert_eq!(h.routing.observed()["api/v1"], 100);
    assert_eq!(h.routing.observed()["api/v2"], 0);
    assert_eq!(h.compute.calls_of(ComputeOp::Stop)[0].key, "api/v2");
    assert!(store.get_rollout("api").unwrap().is_none());
    assert_eq!(store.list_history("api", 5).unwrap().len(), 1);

    // Nothing left to recover.
    assert!(matches!(
        h.controller.recover("api").await,
        Err(CutoverError::NotFound(_))
    ));
}

/// A rollout record as a process killed mid-flight leaves it: `v1` stable,
/// `v2` in the given state, and the run at `phase` with `weight` on `v2`.
fn crashed_rollout(
    store: &StateStore,
    phase: Phase,
    step: usize,
    weight: u8,
    target: LifecycleState,
) -> RolloutState {
    let crashed = harness_with_store(healthy(), store.clone());
    let stable = seed_stable(&crashed, "api", "v1", "v1");
    let mut active = Environment::from_spec(stable.spec(4), 0);
    active.slot = "v2".to_string();
    active.version = "v2".to_string();
    active.state = target;
    let mut state = RolloutState::new(
        "api",
        "prod",
        "v2",
        4,
        plan(StrategyKind::Canary, &[10, 100], Duration::ZERO),
        Some(stable),
        1_000,
    );
    state.phase = phase;
    state.step = step;
    state.weight = weight;
    state.active = Some(active);
    store.put_rollout(&state).unwrap();
    state
}

#[tokio::test]
async fn recover_resends_stable_traffic_even_when_recorded_at_zero() {
    let store = StateStore::open_in_memory().unwrap();
    // Killed after the routing layer took 10% but before the step was recorded.
    crashed_rollout(&store, Phase::Promoting, 0, 0, LifecycleState::Healthy);

    let h = harness_with_store(healthy(), store.clone());
    let recovered = h.controller.recover("api").await.unwrap();

    assert_eq!(recovered.outcome, Some(Outcome::RolledBack));
    assert_eq!(applied_to(&h, "api/v1"), vec![100]);
    assert_eq!(applied_to(&h, "api/v2"), vec![0]);
    assert_eq!(h.routing.observed()["api/v1"], 100);
    assert_eq!(status(&h, "api/v2"), LifecycleState::Terminated);
}

#[tokio::test]
async fn recover_finishes_rollout_interrupted_in_cleanup() {
    let store = StateStore::open_in_memory().unwrap();
    let state = crashed_rollout(&store, Phase::Cleanup, 2, 100, LifecycleState::Healthy);
    // Cleanup records the new stable environment first.
    let mut promoted = state.active.clone().unwrap();
    promoted.state = LifecycleState::Live;
    store.put_stable(&promoted).unwrap();

    let h = harness_with_store(healthy(), store.clone());
    let recovered = h.controller.recover("api").await.unwrap();

    assert_eq!(recovered.outcome, Some(Outcome::Succeeded));
    assert_eq!(h.routing.observed()["api/v2"], 100);
    assert_eq!(h.routing.observed()["api/v1"], 0);
    assert_eq!(status(&h, "api/v2"), LifecycleState::Live);
    assert_eq!(status(&h, "api/v1"), LifecycleState::Terminated);
    assert_eq!(h.compute.calls_of(ComputeOp::Stop)[0].key, "api/v1");

    let stable = store.get_stable("api").unwrap().unwrap();
    assert_eq!(stable.version, "v2");
    assert!(store.get_rollout("api").unwrap().is_none());
}

#[tokio::test]
async fn recovered_rollback_restores_stable_record() {
    let store = StateStore::open_in_memory().unwrap();
    // Cleanup had already recorded v2 as stable when it failed.
    let state = crashed_rollout(
        &store,
        Phase::RollingBack {
            reason: "failed to persist rollout state".to_string(),
        },
        2,
        100,
        LifecycleState::Live,
    );
    store.put_stable(state.active.as_ref().unwrap()).unwrap();

    let h = harness_with_store(healthy(), store.clone());
    let recovered = h.controller.recover("api").await.unwrap();

    assert_eq!(recovered.outcome, Some(Outcome::RolledBack));
    assert_eq!(h.routing.observed()["api/v1"], 100);
    assert_eq!(status(&h, "api/v2"), LifecycleState::Terminated);
    let stable = store.get_stable("api").unwrap().unwrap();
    assert_eq!(stable.version, "v1");
    assert_eq!(stable.state, LifecycleState::Live);
}
