use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use testloom_kernel::build::BuildTool;
use testloom_kernel::pipeline::RunStatus;
use testloom_pipeline::artifact::ArtifactNaming;
use testloom_pipeline::config::{ConfigOverrides, process_env};
use testloom_pipeline::controller::LoopController;
use testloom_pipeline::history::JsonlHistory;
use testloom_router::client::CompletionClient;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::common::{catalog_for, load_config, print_result};

pub struct RunArgs {
    pub project: PathBuf,
    pub config: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

pub async fn execute(args: &RunArgs) -> Result<()> {
    let config = load_config(&args.project, args.config.as_deref(), &args.overrides)?;
    let resolved = config.resolve(&args.project, &process_env)?;

    let scan = catalog_for(&config, &args.project)?
        .scan()
        .context("failed to scan source directory")?;
    for skipped in &scan.skipped {
        eprintln!("skipping {}: {}", skipped.name, skipped.reason);
    }
    if scan.units.is_empty() {
        eprintln!(
            "no `*{}` files in {}; nothing to do",
            resolved.definition_suffix,
            resolved.source_dir.display()
        );
        return Ok(());
    }

    let client = Arc::new(CompletionClient::new(
        Arc::new(resolved.provider()),
        resolved.client_settings(),
    ));
    let build: Arc<dyn BuildTool> = Arc::new(resolved.shell_build());
    let controller = LoopController::from_config(&resolved, client, build)
        .with_history(JsonlHistory::new(&args.project));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    eprintln!(
        "generating tests for {} unit(s) with {}...",
        scan.units.len(),
        resolved.model
    );
    let result = controller.run(&scan.units, &cancel).await;

    print_result(&result);

    match result.status {
        RunStatus::Done => Ok(()),
        status => {
            let msg = result.error.unwrap_or_else(|| status.to_string());
            bail!("run failed ({status}): {msg}");
        }
    }
}

/// List what a run would generate, and check naming, without any requests.
pub fn dry_run(args: &RunArgs) -> Result<()> {
    let config = load_config(&args.project, args.config.as_deref(), &args.overrides)?;
    let catalog = catalog_for(&config, &args.project)?;
    let scan = catalog.scan().context("failed to scan source directory")?;

    let naming = ArtifactNaming::new(config.output.artifact_suffix.clone());
    let output_dir = args.project.join(&config.output.dir);

    println!("source: {}", catalog.dir().display());
    println!("units:  {}", scan.units.len());
    for unit in &scan.units {
        println!(
            "  {} -> {}",
            unit.name,
            naming.path_for(&output_dir, &unit.name).display()
        );
    }
    for skipped in &scan.skipped {
        println!("  skipped {}: {}", skipped.name, skipped.reason);
    }

    naming.check_collisions(&scan.units)?;
    Ok(())
}
