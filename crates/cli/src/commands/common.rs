use std::path::Path;

use anyhow::{Context, Result};
use testloom_kernel::pipeline::RunResult;
use testloom_pipeline::catalog::SourceCatalog;
use testloom_pipeline::config::{ConfigOverrides, LoomConfig, process_env};

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load config from file and environment, then apply flag overrides.
pub fn load_config(
    project: &Path,
    config_path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<LoomConfig> {
    let mut config = LoomConfig::load(project, config_path, &process_env)
        .with_context(|| format!("failed to load config for {}", project.display()))?;
    overrides.apply(&mut config);
    Ok(config)
}

/// Build the catalog without requiring a credential or model.
pub fn catalog_for(config: &LoomConfig, project: &Path) -> Result<SourceCatalog> {
    let source_dir = config
        .catalog
        .source_dir
        .as_ref()
        .map(|d| project.join(d))
        .context("missing required configuration `catalog.source_dir`")?;
    Ok(SourceCatalog::new(
        source_dir,
        config.catalog.definition_suffix.clone(),
        config.catalog.declaration_suffix.clone(),
    ))
}

// ---------------------------------------------------------------------------
// Result display
// ---------------------------------------------------------------------------

pub fn print_result(result: &RunResult) {
    eprintln!();
    eprintln!("=== Run Result ===");
    eprintln!("status:      {}", result.status);
    eprintln!("builds:      {}", result.build_invocations);
    eprintln!("refinements: {}", result.refinement_passes);
    eprintln!("artifacts:   {}", result.artifacts.len());
    for path in &result.artifacts {
        eprintln!("  {}", path.display());
    }
    if !result.skipped_units.is_empty() {
        eprintln!("skipped:     {}", result.skipped_units.len());
        for skipped in &result.skipped_units {
            eprintln!("  {}: {}", skipped.name, skipped.reason);
        }
    }
    if let Some(ref err) = result.error {
        eprintln!("error:       {err}");
    }

    eprintln!();
    eprintln!("{}", result.usage.display());
    eprintln!("events: {}", result.events.len());

    if !result.is_success()
        && let Some(ref log) = result.last_build_output
    {
        eprintln!();
        eprintln!("--- last build output (tail) ---");
        for line in tail(log, 40) {
            eprintln!("{line}");
        }
    }
}

fn tail(text: &str, n: usize) -> impl Iterator<Item = &str> {
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines.into_iter().skip(skip)
}
