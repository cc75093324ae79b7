//! Subcommand implementations and the wiring they share.

pub mod deploy;
pub mod init;
pub mod plan;
pub mod recover;
pub mod serve;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use cutover_core::{abort_pair, AbortSignal, CutoverConfig, CutoverError, Outcome, RolloutState};
use cutover_env::{CommandCompute, ComputeBackend, EnvironmentManager, MemoryCompute};
use cutover_health::{HealthChecker, StaticProbe, TokioClock};
use cutover_rollout::RolloutController;
use cutover_router::{CommandRouting, MemoryRouting, RoutingBackend, TrafficRouter};
use cutover_state::StateStore;

const DEFAULT_CONFIG: &str = "cutover.toml";
const DEFAULT_STATE_DIR: &str = ".cutover";
const STATE_FILE: &str = "cutover.redb";

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub config: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

impl GlobalOpts {
    /// `--config`, then `$CUTOVER_CONFIG`, then `./cutover.toml` when it
    /// exists. With none of those every section takes its defaults.
    pub fn load_config(&self) -> anyhow::Result<CutoverConfig> {
        let explicit = self
            .config
            .clone()
            .or_else(|| std::env::var_os("CUTOVER_CONFIG").map(PathBuf::from));
        let config = match explicit {
            Some(path) => CutoverConfig::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG).exists() => {
                CutoverConfig::from_file(Path::new(DEFAULT_CONFIG))?
            }
            None => CutoverConfig::default(),
        };
        Ok(config)
    }

    /// `--state-dir`, then `$CUTOVER_STATE_DIR`, then `[state] dir`.
    pub fn state_dir(&self, config: &CutoverConfig) -> PathBuf {
        self.state_dir
            .clone()
            .or_else(|| std::env::var_os("CUTOVER_STATE_DIR").map(PathBuf::from))
            .or_else(|| config.state.as_ref().map(|s| PathBuf::from(&s.dir)))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }

    pub fn state_path(&self, config: &CutoverConfig) -> PathBuf {
        self.state_dir(config).join(STATE_FILE)
    }

    pub fn open_store(&self, config: &CutoverConfig) -> anyhow::Result<StateStore> {
        let dir = self.state_dir(config);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;
        let path = dir.join(STATE_FILE);
        let store = StateStore::open(&path)?;
        info!(path = ?path, "state store opened");
        Ok(store)
    }
}

/// Controller wired to the backends named in `cutover.toml`. Sections
/// that are absent fall back to in-memory backends.
pub fn build_controller(config: &CutoverConfig, store: StateStore) -> anyhow::Result<RolloutController> {
    let compute: Arc<dyn ComputeBackend> = match &config.platform {
        Some(platform) => Arc::new(CommandCompute::new(platform.clone())),
        None => {
            warn!("no [platform] section, environments are only tracked in memory");
            Arc::new(MemoryCompute::new())
        }
    };
    let routing: Arc<dyn RoutingBackend> = match &config.router {
        Some(router) => Arc::new(CommandRouting::new(router.clone(), config.verify_interval()?)),
        None => {
            warn!("no [router] section, traffic weights are only tracked in memory");
            Arc::new(MemoryRouting::new())
        }
    };
    Ok(RolloutController::new(
        EnvironmentManager::new(compute),
        TrafficRouter::new(routing),
        HealthChecker::http(),
        store,
    ))
}

/// Controller that touches nothing outside the process.
pub fn dry_run_controller(store: StateStore) -> RolloutController {
    RolloutController::new(
        EnvironmentManager::new(Arc::new(MemoryCompute::new())),
        TrafficRouter::new(Arc::new(MemoryRouting::new())),
        HealthChecker::new(Arc::new(StaticProbe::healthy()), Arc::new(TokioClock)),
        store,
    )
}

/// Abort signal fired by Ctrl-C.
pub fn abort_on_ctrl_c() -> AbortSignal {
    let (handle, signal) = abort_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, rolling back at the next pause");
            handle.abort();
        }
    });
    signal
}

// ── Exit codes ─────────────────────────────────────────────────────

pub fn outcome_code(outcome: Option<Outcome>) -> u8 {
    match outcome {
        Some(Outcome::Succeeded) => 0,
        Some(Outcome::RolledBack) => 2,
        Some(Outcome::Failed) => 3,
        None => 1,
    }
}

pub fn error_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CutoverError>() {
        Some(e) if e.is_config_error() => 4,
        Some(CutoverError::RolloutInProgress(_)) => 5,
        Some(CutoverError::RollbackFailed { .. }) => 3,
        _ => 1,
    }
}

// ── Output ─────────────────────────────────────────────────────────

pub fn print_rollout(state: &RolloutState, format: &str) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(state)?),
        _ => println!("{}", render_rollout(state)),
    }
    Ok(())
}

/// Multi-line text summary of a rollout record.
pub fn render_rollout(state: &RolloutState) -> String {
    let (mark, status) = match state.outcome {
        Some(Outcome::Succeeded) => ("✓", Outcome::Succeeded.to_string()),
        Some(outcome) => ("✗", outcome.to_string()),
        None => ("…", state.phase.name().to_string()),
    };

    let mut lines = vec![format!(
        "{mark} {} {} {status} ({})",
        state.service, state.version, state.plan.strategy
    )];
    if let Some(env) = &state.active {
        lines.push(format!(
            "  target:  {} ({}, {} replicas) at {}%",
            env.key(),
            env.state,
            env.replicas,
            state.weight
        ));
    }
    if let Some(env) = &state.stable {
        lines.push(format!("  stable:  {} {} ({})", env.key(), env.version, env.state));
    }
    lines.push(format!("  step:    {}/{}", state.step, state.plan.steps.len()));
    if let Some(reason) = &state.reason {
        lines.push(format!("  reason:  {reason}"));
    }
    if let Some(diagnostics) = &state.diagnostics {
        lines.push("  manual intervention required".to_string());
        lines.push(format!("  diagnostics: {diagnostics}"));
    }
    lines.join("\n")
}
