use std::path::Path;

use cutover_core::config::ServiceConfig;
use cutover_core::CutoverConfig;

pub fn init(path: &str, service: &str, force: bool) -> anyhow::Result<()> {
    let output = Path::new(path).join("cutover.toml");
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let config = CutoverConfig {
        service: Some(ServiceConfig {
            name: service.to_string(),
            namespace: Some("default".to_string()),
            replicas: Some(2),
        }),
        ..CutoverConfig::default()
    };
    std::fs::write(&output, config.to_toml_string()?)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
