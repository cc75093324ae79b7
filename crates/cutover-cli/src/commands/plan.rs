use std::time::Duration;

use cutover_core::{parse_duration, CutoverConfig, CutoverError, CutoverResult, RolloutPlan, StrategyKind};

use super::GlobalOpts;

/// Build a plan from CLI arguments, filling gaps from `cutover.toml`.
pub fn resolve_plan(
    config: &CutoverConfig,
    strategy: &str,
    percents: &[u32],
    pause: Option<&str>,
) -> CutoverResult<RolloutPlan> {
    let strategy: StrategyKind = strategy.parse()?;
    let pause = match pause {
        Some(s) => parse_duration(s)
            .ok_or_else(|| CutoverError::Config(format!("--pause: invalid duration '{s}'")))?,
        None => config.pause()?,
    };
    let weights = if percents.is_empty() {
        config.default_steps(strategy)
    } else {
        percents.to_vec()
    };
    RolloutPlan::new(strategy, &weights, pause, config.retry_policy()?)
}

pub fn plan(
    globals: &GlobalOpts,
    strategy: &str,
    percents: &[u32],
    pause: Option<&str>,
    replicas: Option<u32>,
    format: &str,
) -> anyhow::Result<()> {
    let config = globals.load_config()?;
    let plan = resolve_plan(&config, strategy, percents, pause)?;
    let replicas = replicas
        .or_else(|| config.service.as_ref().and_then(|s| s.replicas))
        .unwrap_or(1);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&plan)?),
        _ => println!("{}", render_plan(&plan, replicas)),
    }
    Ok(())
}

fn render_plan(plan: &RolloutPlan, replicas: u32) -> String {
    let retry = &plan.retry;
    let mut lines = vec![format!(
        "✓ {} plan, {} step(s), health: {} attempt(s) every {}",
        plan.strategy,
        plan.steps.len(),
        retry.max_attempts,
        human(retry.interval)
    )];
    for (idx, step) in plan.steps.iter().enumerate() {
        let mut line = format!(
            "  step {}: {:>3}%  replicas {}/{}",
            idx + 1,
            step.weight,
            plan.replicas_at(step.weight, replicas),
            replicas
        );
        if step.weight < 100 && !step.pause.is_zero() {
            line.push_str(&format!("  then pause {}", human(step.pause)));
        }
        lines.push(line);
    }
    lines.join("\n")
}

fn human(d: Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}
