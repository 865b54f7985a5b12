//! Configuration check command

use anyhow::Result;

use hangar::config::{Configuration, EngineKind};

pub fn run(config_path: &str) -> Result<()> {
    let config = Configuration::load(config_path)?;

    let engine = match config.engine.enabled_engine()? {
        EngineKind::Docker => format!("docker (image {})", config.engine.docker.image),
        EngineKind::Gcp => format!(
            "gcp (project {}, zone {})",
            config.engine.gcp.project, config.engine.gcp.zone
        ),
    };

    println!("Configuration OK");
    println!("  github: {}", config.github.url);
    println!(
        "  scale set: {} (group {:?}, {}..={} runners)",
        config.scaleset.name,
        config.scaleset.runner_group,
        config.scaleset.min_runners,
        config.scaleset.max_runners
    );
    println!("  engine: {}", engine);

    Ok(())
}
