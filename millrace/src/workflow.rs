//! The workflow: an op pipeline plus the UNFIT → FIT state machine.
//!
//! Fitting is a map-reduce over read tasks: every task folds its partitions
//! into a [`StatAggregator`], the aggregators merge pairwise on the worker pool,
//! and the merged result is frozen. Only fitting takes `&mut self`; the
//! transform pass borrows the frozen statistics read-only, so transforming
//! held-out data can never leak into them.
//!
//! When a column group carries more than one stateful op, the later op must
//! see data already transformed by the earlier one. Fitting then runs in
//! stages: each stage collects the first still-unfrozen stateful op of every
//! group, with every op ahead of it applied using the statistics frozen by
//! earlier stages.

use std::path::Path;

use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::{ColumnRole, Partition, Schema};
use crate::embedding::{EmbeddingSize, EmbeddingSizeEstimator};
use crate::error::{Error, Result, StateError};
use crate::ops::{order_warnings, Op};
use crate::source::PartitionSource;
use crate::stats::{FrozenStats, OpStats, StatAggregator};
use crate::store::StatsStore;
use crate::writer::{OutputManifest, PartitionedWriter, WriterConfig};

// ============================================================================
// Options and state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Worker threads for both passes. 0 lets rayon pick.
    pub num_workers: usize,
    /// Show progress bars on stderr.
    pub progress: bool,
    pub writer: WriterConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            num_workers: 0,
            progress: false,
            writer: WriterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum WorkflowState {
    #[default]
    Unfit,
    Fit(FrozenStats),
}

// ============================================================================
// Workflow
// ============================================================================

#[derive(Debug, Clone)]
pub struct Workflow {
    schema: Schema,
    ops: Vec<Op>,
    options: RunOptions,
    state: WorkflowState,
}

impl Workflow {
    /// A new, unfit workflow. Ops run in the order given.
    pub fn new(schema: Schema, ops: Vec<Op>) -> Result<Self> {
        schema.validate()?;
        for op in &ops {
            op.validate()?;
        }
        for warning in order_warnings(&ops) {
            warn!("{warning}");
        }
        Ok(Self {
            schema,
            ops,
            options: RunOptions::default(),
            state: WorkflowState::Unfit,
        })
    }

    pub fn with_options(mut self, options: RunOptions) -> Result<Self> {
        options.writer.validate()?;
        self.options = options;
        Ok(self)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn is_fit(&self) -> bool {
        matches!(self.state, WorkflowState::Fit(_))
    }

    pub fn frozen_stats(&self) -> Result<&FrozenStats, StateError> {
        match &self.state {
            WorkflowState::Fit(stats) => Ok(stats),
            WorkflowState::Unfit => Err(StateError::NotFit),
        }
    }

    /// With `record_stats`, fit on `source` and then write it transformed;
    /// otherwise only transform with the statistics already frozen.
    ///
    /// `record_stats` on a workflow that is already fit is a state error:
    /// call [`Workflow::refit`] to deliberately replace the statistics.
    pub fn apply(&mut self, source: &PartitionSource, output: impl AsRef<Path>, record_stats: bool) -> Result<OutputManifest> {
        if record_stats {
            self.fit(source)?;
        }
        self.transform(source, output)
    }

    /// Fit pass only: UNFIT → FIT.
    pub fn fit(&mut self, source: &PartitionSource) -> Result<()> {
        if self.is_fit() {
            return Err(StateError::AlreadyFit.into());
        }
        let frozen = self.compute_stats(source)?;
        self.state = WorkflowState::Fit(frozen);
        Ok(())
    }

    /// Discard any frozen statistics and fit again. The old statistics stay in
    /// place until the new fit succeeds.
    pub fn refit(&mut self, source: &PartitionSource) -> Result<()> {
        if self.is_fit() {
            warn!("Refitting: existing frozen statistics will be replaced");
        }
        let frozen = self.compute_stats(source)?;
        self.state = WorkflowState::Fit(frozen);
        Ok(())
    }

    /// Transform pass only. Requires FIT.
    pub fn transform(&self, source: &PartitionSource, output: impl AsRef<Path>) -> Result<OutputManifest> {
        let frozen = self.frozen_stats()?;
        self.check_source(source)?;
        let pool = self.thread_pool()?;
        let output = output.as_ref();

        info!(
            "Transform pass: {} rows in {} tasks -> {}",
            source.num_rows(),
            source.tasks().len(),
            output.display()
        );
        let writer = PartitionedWriter::create(output, &self.schema, &self.options.writer)?;
        let pb = self.progress_bar(source.tasks().len(), "  Transform  ");

        let pass = {
            let sink = writer.sink();
            pool.install(|| {
                source.tasks().par_iter().try_for_each(|task| -> Result<()> {
                    for (batch, partition) in source.read(task)?.enumerate() {
                        let partition = self.apply_ops(frozen, partition?);
                        sink.send(task.index, batch, partition)?;
                    }
                    pb.inc(1);
                    Ok(())
                })
            })
        };
        pb.finish_and_clear();

        match pass {
            Ok(()) => writer.finish(),
            // a writer that failed first explains the disconnect better than the disconnect
            Err(e) => match (e, writer.abort()) {
                (Error::WriterDisconnected, Err(writer_err)) => Err(writer_err),
                (e, _) => Err(e),
            },
        }
    }

    /// Apply the full pipeline to one in-memory partition. Requires FIT, and the
    /// partition must carry exactly this workflow's coerced Arrow schema.
    pub fn transform_partition(&self, partition: Partition) -> Result<Partition> {
        let frozen = self.frozen_stats()?;
        if partition.schema() != &self.schema.arrow_schema() {
            return Err(StateError::Mismatch(format!(
                "partition schema {:?} differs from the workflow schema",
                partition.schema().fields().iter().map(|f| f.name()).collect::<Vec<_>>()
            ))
            .into());
        }
        Ok(self.apply_ops(frozen, partition))
    }

    /// Embedding widths for every categorical column. Requires FIT.
    pub fn embedding_sizes(&self, estimator: &EmbeddingSizeEstimator) -> Result<IndexMap<String, EmbeddingSize>> {
        estimator.validate()?;
        Ok(estimator.estimate_all(self.frozen_stats()?))
    }

    /// Persist the frozen statistics. Requires FIT.
    pub fn save_stats(&self, dir: impl AsRef<Path>) -> Result<()> {
        let frozen = self.frozen_stats()?;
        StatsStore::new(dir.as_ref()).save(&self.schema, &self.ops, frozen)
    }

    /// A FIT workflow restored from `dir`. The saved schema and ops must equal
    /// the ones given.
    pub fn load(dir: impl AsRef<Path>, schema: Schema, ops: Vec<Op>) -> Result<Self> {
        let (saved_schema, saved_ops, frozen) = StatsStore::new(dir.as_ref()).load()?;
        if saved_schema != schema {
            return Err(StateError::Mismatch(format!(
                "saved schema {saved_schema:?} differs from {schema:?}"
            ))
            .into());
        }
        if saved_ops != ops {
            return Err(StateError::Mismatch(format!(
                "saved pipeline has {} ops [{}], this workflow has {} ops [{}]",
                saved_ops.len(),
                op_names(&saved_ops),
                ops.len(),
                op_names(&ops)
            ))
            .into());
        }
        let mut workflow = Self::new(schema, ops)?;
        workflow.state = WorkflowState::Fit(frozen);
        Ok(workflow)
    }

    /// A FIT workflow rebuilt entirely from what `dir` holds.
    pub fn from_saved(dir: impl AsRef<Path>) -> Result<Self> {
        let (schema, ops, frozen) = StatsStore::new(dir.as_ref()).load()?;
        let mut workflow = Self::new(schema, ops)?;
        workflow.state = WorkflowState::Fit(frozen);
        Ok(workflow)
    }

    // ------------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------------

    fn compute_stats(&self, source: &PartitionSource) -> Result<FrozenStats> {
        self.check_source(source)?;
        let pool = self.thread_pool()?;
        let mut frozen = FrozenStats::empty(self.ops.len());

        let mut stage_num = 0;
        loop {
            let stage = self.next_stage(&frozen);
            if stage.is_empty() {
                break;
            }
            stage_num += 1;
            info!(
                "Fit stage {}: collecting [{}] over {} rows in {} tasks",
                stage_num,
                stage.iter().map(|&i| format!("{i}:{}", self.ops[i].name())).collect::<Vec<_>>().join(", "),
                source.num_rows(),
                source.tasks().len()
            );

            let pb = self.progress_bar(source.tasks().len(), "  Fit        ");
            let aggregate = pool.install(|| {
                source
                    .tasks()
                    .par_iter()
                    .map(|task| -> Result<StatAggregator> {
                        let mut agg = StatAggregator::default();
                        for partition in source.read(task)? {
                            agg = agg.merge(self.collect_stage(&frozen, &stage, partition?));
                        }
                        pb.inc(1);
                        Ok(agg)
                    })
                    .try_reduce(StatAggregator::default, |a, b| Ok(a.merge(b)))
            })?;
            pb.finish_and_clear();

            for (index, stats) in aggregate.freeze(&self.schema, &self.ops, &stage) {
                log_frozen(index, &stats);
                frozen.set(index, stats);
            }
        }

        if stage_num == 0 {
            info!("Pipeline has no stateful ops; nothing to fit");
        }
        Ok(frozen)
    }

    /// The first unfrozen stateful op of each column group.
    fn next_stage(&self, frozen: &FrozenStats) -> Vec<usize> {
        let mut stage = Vec::new();
        let mut groups: Vec<ColumnRole> = Vec::new();
        for (i, op) in self.ops.iter().enumerate() {
            if op.is_stateful() && frozen.op(i).is_none() && !groups.contains(&op.group()) {
                groups.push(op.group());
                stage.push(i);
            }
        }
        stage
    }

    /// Run one partition up to the ops of `stage` and collect their statistics.
    /// Ops of a group are applied only while they precede that group's stage op.
    fn collect_stage(&self, frozen: &FrozenStats, stage: &[usize], mut partition: Partition) -> StatAggregator {
        let mut agg = StatAggregator::default();
        for (i, op) in self.ops.iter().enumerate() {
            match stage.iter().find(|&&s| self.ops[s].group() == op.group()) {
                Some(&s) if s == i => {
                    if let Some(partial) = op.collect(&self.schema, &partition) {
                        agg.insert(i, partial);
                    }
                }
                Some(&s) if i < s => {
                    partition = op.apply(&self.schema, partition, frozen.op(i));
                }
                _ => {}
            }
        }
        agg
    }

    fn apply_ops(&self, frozen: &FrozenStats, partition: Partition) -> Partition {
        self.ops
            .iter()
            .enumerate()
            .fold(partition, |p, (i, op)| op.apply(&self.schema, p, frozen.op(i)))
    }

    fn check_source(&self, source: &PartitionSource) -> Result<()> {
        if source.schema() != &self.schema {
            return Err(StateError::Mismatch("partition source was opened with a different schema".to_string()).into());
        }
        Ok(())
    }

    fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.num_workers)
            .thread_name(|i| format!("millrace-{i}"))
            .build()?)
    }

    fn progress_bar(&self, len: usize, label: &str) -> ProgressBar {
        if !self.options.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::with_template(&format!(
            "{label}{{bar:40.cyan/blue}} {{pos}}/{{len}} tasks [{{elapsed_precise}}]"
        )) {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }
}

fn op_names(ops: &[Op]) -> String {
    ops.iter().map(Op::name).collect::<Vec<_>>().join(", ")
}

fn log_frozen(index: usize, stats: &OpStats) {
    match stats {
        OpStats::Categorify(tables) => {
            for (name, table) in tables {
                info!(
                    "  op {index} categorify {name}: cardinality {}, {} rows folded into other, {} nulls",
                    table.cardinality(),
                    table.num_other(),
                    table.num_nulls()
                );
            }
        }
        OpStats::Normalize(columns) => {
            for (name, s) in columns {
                debug!(
                    "  op {index} normalize {name}: count {}, mean {:.6}, std {:.6}",
                    s.count, s.mean, s.std
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
