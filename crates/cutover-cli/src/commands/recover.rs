use tracing::info;

use super::{build_controller, outcome_code, print_rollout, GlobalOpts};

/// Roll back whatever a crashed `deploy` left behind for `service`.
pub async fn recover(globals: &GlobalOpts, service: &str, format: &str) -> anyhow::Result<u8> {
    let config = globals.load_config()?;
    let store = globals.open_store(&config)?;

    let Some(interrupted) = store.get_rollout(service)? else {
        println!("nothing to recover for {service}");
        return Ok(0);
    };
    info!(
        %service,
        version = %interrupted.version,
        phase = interrupted.phase.name(),
        "recovering interrupted rollout"
    );

    let controller = build_controller(&config, store)?;
    let state = controller.recover(service).await?;

    print_rollout(&state, format)?;
    Ok(outcome_code(state.outcome))
}
