//! Cascade R-CNN CLI
//!
//! Runs the cascade core over recorded head outputs, inspects per-stage
//! matching and prints preset configurations.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use rayon::ThreadPoolBuilder;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

use commands::assign::AssignCommand;
use commands::config::ConfigCommand;
use commands::infer::InferCommand;

#[derive(Parser)]
#[command(
    name = "cascade-rcnn",
    version,
    about = "Multi-stage box refinement for two-stage object detectors",
    after_help = "EXAMPLES:\n  \
                  # Print the three-stage preset\n  \
                  cascade-rcnn config > cascade.yaml\n\n  \
                  # Assemble detections from recorded head outputs\n  \
                  cascade-rcnn infer --config cascade.yaml --recording heads.json --output detections.json\n\n  \
                  # Inspect per-stage foreground/background balance\n  \
                  cascade-rcnn assign --config cascade.yaml --input images.json --seed 7"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run inference over recorded head outputs and write detection records
    Infer(InferCommand),

    /// Match and resample proposals at every stage threshold
    Assign(AssignCommand),

    /// Print a preset configuration as YAML
    Config(ConfigCommand),
}

fn main() -> Result<()> {
    // Size the rayon pool from the environment; batches run one image per task
    if let Ok(threads_str) = std::env::var("CASCADE_THREADS") {
        if let Ok(num_threads) = threads_str.parse::<usize>() {
            ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build_global()
                .ok(); // Ignore error if already initialized
        }
    }

    let cli = Cli::parse();

    // Keep `config` output clean YAML
    let log_level = match &cli.command {
        Commands::Config(_) => Level::WARN,
        _ => {
            if cli.verbose {
                Level::DEBUG
            } else {
                Level::INFO
            }
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Infer(cmd) => cmd.execute(),
        Commands::Assign(cmd) => cmd.execute(),
        Commands::Config(cmd) => cmd.execute(),
    }
}
