use cutover_core::RolloutState;

use super::{print_rollout, GlobalOpts};

pub fn status(globals: &GlobalOpts, service: &str, format: &str) -> anyhow::Result<()> {
    let config = globals.load_config()?;
    let store = globals.open_store(&config)?;

    let rollout = store.get_rollout(service)?;
    let stable = store.get_stable(service)?;

    if format == "json" {
        let body = serde_json::json!({
            "service": service,
            "rollout": rollout,
            "stable": stable,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    match (rollout, stable) {
        (Some(rollout), _) => print_rollout(&rollout, format)?,
        (None, Some(env)) => println!(
            "✓ {service} idle, serving {} from {} ({}, {} replicas)",
            env.version,
            env.key(),
            env.state,
            env.replicas
        ),
        (None, None) => println!("no rollouts recorded for {service}"),
    }
    Ok(())
}

pub fn history(globals: &GlobalOpts, service: &str, limit: usize, format: &str) -> anyhow::Result<()> {
    let config = globals.load_config()?;
    let store = globals.open_store(&config)?;
    let entries = store.list_history(service, limit.max(1))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ if entries.is_empty() => println!("no finished rollouts for {service}"),
        _ => {
            for entry in &entries {
                println!("{}", history_line(entry));
            }
        }
    }
    Ok(())
}

fn history_line(state: &RolloutState) -> String {
    let outcome = state
        .outcome
        .map(|o| o.to_string())
        .unwrap_or_else(|| state.phase.name().to_string());
    let mut line = format!(
        "{:<13} {:<10} {:<11} {:<12} started {}",
        state.version,
        state.plan.strategy.to_string(),
        outcome,
        format!("{}/{} steps", state.step, state.plan.steps.len()),
        state.started_at / 1000
    );
    if let Some(reason) = &state.reason {
        line.push_str(&format!("  ({reason})"));
    }
    line
}
