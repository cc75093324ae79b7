use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;
use tracing::{info, warn};

use cutover_core::{CutoverConfig, CutoverError};
use cutover_rollout::RolloutRequest;
use cutover_state::StateStore;

use super::plan::resolve_plan;
use super::{
    abort_on_ctrl_c, build_controller, dry_run_controller, outcome_code, print_rollout, GlobalOpts,
};

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Version to roll out
    #[arg(id = "target_version", value_name = "VERSION")]
    pub version: String,
    /// blue-green, rolling, or canary
    pub strategy: String,
    /// Traffic percentages (default: from cutover.toml)
    pub percents: Vec<u32>,
    /// Service name (default: [service].name)
    #[arg(long)]
    pub service: Option<String>,
    /// Namespace (default: [service].namespace, then "default")
    #[arg(long)]
    pub namespace: Option<String>,
    /// Replicas of the fully promoted environment
    #[arg(long)]
    pub replicas: Option<u32>,
    /// Pause between steps, e.g. 30s
    #[arg(long)]
    pub pause: Option<String>,
    /// Run against in-memory backends with healthy probes and no pauses
    #[arg(long)]
    pub dry_run: bool,
    /// Serve the status API on this port while the rollout runs
    #[arg(long)]
    pub api_port: Option<u16>,
    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

pub async fn deploy(globals: &GlobalOpts, args: DeployArgs) -> anyhow::Result<u8> {
    let config = globals.load_config()?;
    let service_config = config.service.as_ref();

    let service = args
        .service
        .or_else(|| service_config.map(|s| s.name.clone()))
        .ok_or_else(|| {
            CutoverError::Config("no service given; pass --service or set [service].name".to_string())
        })?;
    let namespace = args
        .namespace
        .or_else(|| service_config.and_then(|s| s.namespace.clone()))
        .unwrap_or_else(|| "default".to_string());
    let replicas = args
        .replicas
        .or_else(|| service_config.and_then(|s| s.replicas))
        .unwrap_or(1);

    let mut plan = resolve_plan(&config, &args.strategy, &args.percents, args.pause.as_deref())?;

    let (controller, store) = if args.dry_run {
        for step in &mut plan.steps {
            step.pause = Duration::ZERO;
        }
        let store = StateStore::open_in_memory()?;
        seed_dry_run(globals, &config, &service, &store);
        (dry_run_controller(store.clone()), store)
    } else {
        let store = globals.open_store(&config)?;
        (build_controller(&config, store.clone())?, store)
    };

    if let Some(port) = args.api_port {
        let store = store.clone();
        tokio::spawn(async move {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            if let Err(e) = cutover_api::serve(store, addr, std::future::pending()).await {
                warn!(error = %e, "status API stopped");
            }
        });
    }

    info!(
        %service,
        version = %args.version,
        strategy = %plan.strategy,
        steps = plan.steps.len(),
        dry_run = args.dry_run,
        "starting rollout"
    );

    let request = RolloutRequest {
        service,
        namespace,
        version: args.version,
        replicas,
        plan,
        endpoint: config.endpoint_template(),
    };
    let state = controller.run(request, abort_on_ctrl_c()).await?;

    print_rollout(&state, &args.format)?;
    Ok(outcome_code(state.outcome))
}

/// Copy the real stable record into the dry-run store so the rehearsal
/// follows the same path a real rollout would. Best effort.
fn seed_dry_run(globals: &GlobalOpts, config: &CutoverConfig, service: &str, store: &StateStore) {
    let path = globals.state_path(config);
    if !path.exists() {
        return;
    }
    let stable = StateStore::open(&path).and_then(|real| real.get_stable(service));
    match stable {
        Ok(Some(env)) => {
            if let Err(e) = store.put_stable(&env) {
                warn!(error = %e, "could not seed dry run");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "could not read stable environment for dry run"),
    }
}
