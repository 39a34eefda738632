//! Inspect a frozen statistics store: dump the pipeline, category tables,
//! continuous statistics and the embedding sizes they imply.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --stats data/processed/stats
//! cargo run --release --bin inspect -- --stats data/processed/stats --top 20 --output data/processed/train
//! ```

use std::path::PathBuf;

use clap::Parser;
use millrace::stats::OpStats;
use millrace::{EmbeddingSizeEstimator, OutputManifest, Workflow, WorkflowConfig};

#[derive(Parser, Debug)]
#[command(about = "Inspect frozen feature statistics")]
struct Args {
    /// Path to the statistics directory written by `preprocess`.
    #[arg(long)]
    stats: PathBuf,

    /// Workflow config whose embedding heuristic to use (defaults otherwise).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Most frequent categories to list per column (0 to skip).
    #[arg(long, default_value_t = 10)]
    top: usize,

    /// An output root whose manifest to summarize.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let workflow = Workflow::from_saved(&args.stats)?;
    let frozen = workflow.frozen_stats()?;
    let schema = workflow.schema();
    let estimator = match &args.config {
        Some(path) => WorkflowConfig::from_path(path)?.embedding,
        None => EmbeddingSizeEstimator::default(),
    };

    // ── Overview ──────────────────────────────────────────────────────────
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Statistics: {}", args.stats.display());
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Continuous:  {:>10}", schema.continuous.len());
    println!("║  Categorical: {:>10}", schema.categorical.len());
    println!("║  Label:       {:>10}", schema.label.len());
    println!("║  Ops:         {:>10}", workflow.ops().len());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // ── Pipeline ─────────────────────────────────────────────────────────
    println!("┌─ Pipeline");
    for (i, op) in workflow.ops().iter().enumerate() {
        let state = if op.is_stateful() { "stateful" } else { "stateless" };
        println!("│  [{i}] {:<12} {:<24} {state}  {:?}", op.name(), op.role.to_string(), op.transform);
    }
    println!("└──────────────────────────────────────────────────────────────");
    println!();

    // ── Frozen statistics ────────────────────────────────────────────────
    for (i, stats) in frozen.iter() {
        match stats {
            OpStats::Normalize(columns) => {
                println!("┌─ Op {i}: normalize");
                for (name, s) in columns {
                    println!(
                        "│  {name:<20} count {:>12}  nulls {:>10}  mean {:>14.6}  std {:>14.6}",
                        s.count, s.num_nulls, s.mean, s.std
                    );
                }
            }
            OpStats::Categorify(tables) => {
                println!("┌─ Op {i}: categorify");
                for (name, table) in tables {
                    println!(
                        "│  {name:<20} cardinality {:>10}  threshold {:>6}  nulls {:>10}  other {:>10}",
                        table.cardinality(),
                        table.freq_threshold(),
                        table.num_nulls(),
                        table.num_other()
                    );
                    let show = args.top.min(table.categories().len());
                    for (rank, (value, count)) in table
                        .categories()
                        .iter()
                        .zip(table.counts())
                        .take(show)
                        .enumerate()
                    {
                        println!("│      {:>8} ← {value:<20} ({count} rows)", rank as i64 + 2);
                    }
                    if table.categories().len() > show && show > 0 {
                        println!("│      ... ({} more)", table.categories().len() - show);
                    }
                }
            }
        }
        println!("└──────────────────────────────────────────────────────────────");
        println!();
    }

    // ── Embedding sizes ──────────────────────────────────────────────────
    let sizes = workflow.embedding_sizes(&estimator)?;
    if !sizes.is_empty() {
        println!("┌─ Embedding sizes (cap {}, scale {}, exponent {})", estimator.cap, estimator.scale, estimator.exponent);
        for (name, size) in &sizes {
            println!("│  {name:<20} {:>10} → {:>4}", size.cardinality, size.dimension);
        }
        println!("└──────────────────────────────────────────────────────────────");
        println!();
    }

    // ── Output manifest ──────────────────────────────────────────────────
    if let Some(root) = &args.output {
        let manifest = OutputManifest::load(root)?;
        println!("┌─ Output: {}", root.display());
        println!(
            "│  {} rows from {} partitions, written {}",
            manifest.num_rows, manifest.num_partitions, manifest.created_at
        );
        for file in &manifest.files {
            println!("│  {:<28} writer {:>3}  {:>12} rows", file.path, file.writer, file.num_rows);
        }
        println!("└──────────────────────────────────────────────────────────────");
    }

    Ok(())
}
