use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use testloom_pipeline::config::ConfigOverrides;

mod commands;


#[derive(Parser)]
#[command(
    name = "testloom",
    about = "Generate unit tests with an LLM, then repair them until the build is clean",
    version,
    long_version = commands::version::LONG_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate tests, build, and refine until clean
    Run {
        /// Project root (holds .testloom/config.yaml)
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Explicit config file instead of .testloom/config.yaml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Model identifier sent to the completion service
        #[arg(long)]
        model: Option<String>,

        /// Maximum refinement passes
        #[arg(long)]
        max_passes: Option<u32>,

        /// Build command (run with `sh -c` in the project root)
        #[arg(long)]
        build_command: Option<String>,

        /// Concurrent completion requests per stage
        #[arg(long)]
        concurrency: Option<usize>,

        /// List units and artifact paths without calling the service
        #[arg(long)]
        dry_run: bool,

        /// Enable verbose logging
        #[arg(long, short)]
        verbose: bool,
    },

    /// Initialize testloom in a project
    Init {
        /// Path to the project root
        path: PathBuf,
    },

    /// Show resolved configuration and credential presence
    Status {
        /// Project root
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Explicit config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// View run history
    History {
        /// Project root
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Number of entries to show
        #[arg(long, default_value = "10")]
        count: usize,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            project,
            config,
            model,
            max_passes,
            build_command,
            concurrency,
            dry_run,
            verbose,
        } => {
            commands::setup_logging(verbose);
            let overrides = ConfigOverrides {
                model,
                max_passes,
                build_command,
                concurrency,
            };
            let args = commands::run::RunArgs {
                project,
                config,
                overrides,
            };
            if dry_run {
                commands::run::dry_run(&args)
            } else {
                commands::run::execute(&args).await
            }
        }
        Commands::Init { path } => commands::init::execute(&path).await,
        Commands::Status { project, config } => {
            commands::status::execute(&project, config.as_deref())
        }
        Commands::History { project, count } => commands::history::execute(&project, count).await,
        Commands::Version => commands::version::execute(),
    }
}
