//! Preprocess binary: fits a feature workflow on the training split and writes
//! transformed, shuffled train/valid outputs for the training binary.
//!
//! ## Output
//!
//! Written under `--output`:
//! - `train/`: `part-*.parquet` files plus `_manifest.json`
//! - `valid/`: same layout, transformed with the training statistics
//! - `stats/`: frozen statistics (`workflow.json`, `ops/*/*.json`)
//! - `embedding_sizes.json`: categorical column → `{cardinality, dimension}`
//!
//! With `--stats <dir>` no fit happens: the frozen statistics are loaded and
//! every given split is only transformed.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin preprocess -- --config workflow.json \
//!     --train data/train --valid data/valid --output data/processed
//! ```

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use indicatif::HumanDuration;
use tracing::info;

use millrace::embedding::{write_embedding_sizes, EMBEDDING_SIZES_FILE};
use millrace::{PartitionSource, Workflow, WorkflowConfig};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Fit feature statistics on the training split and write transformed datasets")]
struct Args {
    /// Workflow configuration (schema, ops, partitioning, writer, embedding heuristic).
    #[arg(long)]
    config: PathBuf,

    /// Directory of training parquet files. Required unless `--stats` is given.
    #[arg(long)]
    train: Option<PathBuf>,

    /// Directory of validation parquet files.
    #[arg(long)]
    valid: Option<PathBuf>,

    /// Output root; `train/`, `valid/`, `stats/` and the embedding sizes land here.
    #[arg(long)]
    output: PathBuf,

    /// Load previously frozen statistics from this directory instead of fitting.
    #[arg(long)]
    stats: Option<PathBuf>,

    /// Override the configured worker count.
    #[arg(long)]
    num_workers: Option<usize>,

    /// Show progress bars.
    #[arg(long, default_value_t = false)]
    progress: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let start = Instant::now();
    fs::create_dir_all(&args.output)?;

    // ── Step 1: Configuration ───────────────────────────────────────────
    info!("Step 1: Loading configuration from {}", args.config.display());
    let mut config = WorkflowConfig::from_path(&args.config)?;
    if let Some(n) = args.num_workers {
        config.run.num_workers = n;
    }
    config.run.progress |= args.progress;
    let budget = config.partition.budget()?;
    info!(
        "  {} continuous, {} categorical, {} label columns; {} ops",
        config.schema.continuous.len(),
        config.schema.categorical.len(),
        config.schema.label.len(),
        config.ops.len()
    );
    info!(
        "  Partition budget: {} bytes ({:.0}% of host memory)",
        budget.bytes(),
        budget.fraction() * 100.0
    );

    // Open every split up front so a bad input fails before any pass runs.
    let train = args
        .train
        .as_ref()
        .map(|dir| PartitionSource::from_dir(dir, &config.schema, budget))
        .transpose()?;
    let valid = args
        .valid
        .as_ref()
        .map(|dir| PartitionSource::from_dir(dir, &config.schema, budget))
        .transpose()?;

    // ── Step 2: Fit (or load frozen statistics) ─────────────────────────
    let workflow = match &args.stats {
        Some(stats_dir) => {
            info!("Step 2: Loading frozen statistics from {}", stats_dir.display());
            let workflow = Workflow::load(stats_dir, config.schema.clone(), config.ops.clone())?
                .with_options(config.run.clone())?;
            if let Some(train) = &train {
                info!("  Transforming training split");
                workflow.transform(train, args.output.join("train"))?;
            }
            workflow
        }
        None => {
            let train = train.as_ref().ok_or("--train is required unless --stats is given")?;
            info!("Step 2: Fitting on {} training rows", train.num_rows());
            let mut workflow = config.build()?;
            let manifest = workflow.apply(train, args.output.join("train"), true)?;
            info!("  Wrote {} training rows in {} files", manifest.num_rows, manifest.files.len());
            let stats_dir = args.output.join("stats");
            workflow.save_stats(&stats_dir)?;
            info!("  Saved frozen statistics to {}", stats_dir.display());
            workflow
        }
    };

    // ── Step 3: Transform the validation split ──────────────────────────
    if let Some(valid) = &valid {
        info!("Step 3: Transforming {} validation rows", valid.num_rows());
        let manifest = workflow.transform(valid, args.output.join("valid"))?;
        info!("  Wrote {} validation rows in {} files", manifest.num_rows, manifest.files.len());
    } else {
        info!("Step 3: No validation split given, skipping");
    }

    // ── Step 4: Embedding sizes ─────────────────────────────────────────
    info!("Step 4: Estimating embedding sizes");
    let sizes = workflow.embedding_sizes(&config.embedding)?;
    for (name, size) in &sizes {
        info!("  {name}: cardinality {} -> dimension {}", size.cardinality, size.dimension);
    }
    let sizes_path = args.output.join(EMBEDDING_SIZES_FILE);
    write_embedding_sizes(&sizes_path, &sizes)?;

    info!("Done in {}", HumanDuration(start.elapsed()));
    Ok(())
}
