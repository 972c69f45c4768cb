use std::path::Path;

use anyhow::{Result, bail};
use testloom_pipeline::config::{CONFIG_TEMPLATE, LOOM_DIR, LoomConfig};

pub async fn execute(path: &Path) -> Result<()> {
    let loom_dir = path.join(LOOM_DIR);
    let config_path = LoomConfig::default_path(path);

    if config_path.exists() {
        bail!(
            "{} already exists; edit it instead of re-running init",
            config_path.display()
        );
    }

    tokio::fs::create_dir_all(loom_dir.join("logs")).await?;

    // Run logs stay out of version control.
    let gitignore_path = loom_dir.join(".gitignore");
    if !gitignore_path.exists() {
        tokio::fs::write(&gitignore_path, "logs/\n").await?;
    }

    tokio::fs::write(&config_path, CONFIG_TEMPLATE).await?;

    println!("Initialized testloom in {}", path.display());
    println!("  Created: {LOOM_DIR}/config.yaml");
    println!("  Created: {LOOM_DIR}/logs/");
    println!();
    println!("Set completion.model and catalog.source_dir, then export OPENROUTER_API_KEY.");

    Ok(())
}
