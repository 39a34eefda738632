//! Launch the external training binary on the outputs of `preprocess`.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin train -- --trainer ./trainer --config trainer.yaml --output data/processed
//! cargo run --release --bin train -- --trainer ./trainer --config trainer.yaml --output data/processed --dry-run
//! ```
//!
//! Anything after `--` is passed through to the trainer unchanged.

use std::path::PathBuf;

use clap::Parser;
use sluice::TrainerLaunch;
use tracing::info;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Launch model training on preprocessed train/valid outputs")]
struct Args {
    /// Path to the training binary.
    #[arg(long)]
    trainer: PathBuf,

    /// Trainer configuration file, passed through untouched.
    #[arg(long)]
    config: PathBuf,

    /// Output root written by `preprocess` (holds train/, valid/, embedding_sizes.json).
    #[arg(long)]
    output: PathBuf,

    /// Validate the outputs and print the command without running it.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Extra arguments for the trainer.
    #[arg(last = true)]
    extra_args: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut launch = TrainerLaunch::from_output_dir(&args.trainer, &args.config, &args.output);
    launch.extra_args = args.extra_args;

    if args.dry_run {
        let summary = launch.validate()?;
        info!(
            "Outputs OK: {} train rows, {} valid rows, {} categorical columns",
            summary.train_rows,
            summary.valid_rows.unwrap_or(0),
            summary.num_categorical
        );
        println!("{}", serde_json::to_string_pretty(&launch)?);
        info!("Command: {:?}", launch.command());
        return Ok(());
    }

    launch.run()?;
    Ok(())
}
