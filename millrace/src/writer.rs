//! Partitioned writer: shuffles each transformed partition and spreads its rows
//! over a fixed set of Parquet files owned by dedicated writer threads.
//!
//! Everything is written into a staging directory next to the output root.
//! Only when every writer closed its files cleanly is the manifest written and
//! the staging directory renamed onto the root; on failure it is removed, so a
//! retry always starts from scratch.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use arrow::array::UInt64Array;
use arrow::datatypes::SchemaRef;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::{Partition, Schema};
use crate::error::{ConfigError, Error, Result};

/// File name of the manifest at the root of every output directory.
pub const MANIFEST_FILE: &str = "_manifest.json";

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Concurrent writer threads.
    pub num_writers: usize,
    /// Output files owned by each writer.
    pub files_per_writer: usize,
    /// Shuffle rows within each partition before writing.
    pub shuffle: bool,
    /// Fixed shuffle seed. `None` draws from entropy.
    pub seed: Option<u64>,
    /// Partitions queued per writer before transform workers block.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            num_writers: 2,
            files_per_writer: 4,
            shuffle: true,
            seed: None,
            channel_capacity: 4,
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_writers == 0 {
            return Err(ConfigError::Zero("num_writers"));
        }
        if self.files_per_writer == 0 {
            return Err(ConfigError::Zero("files_per_writer"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Zero("channel_capacity"));
        }
        Ok(())
    }
}

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Path relative to the output root.
    pub path: String,
    pub writer: usize,
    pub num_rows: u64,
}

/// Written last: its presence marks a complete output directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub num_rows: u64,
    pub num_partitions: u64,
    pub schema: Schema,
    pub files: Vec<OutputFile>,
}

impl OutputManifest {
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join(MANIFEST_FILE);
        let text = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path, source }.into())
    }

    pub fn file_paths(&self, root: impl AsRef<Path>) -> Vec<PathBuf> {
        self.files.iter().map(|f| root.as_ref().join(&f.path)).collect()
    }
}

fn file_name(writer: usize, slot: usize) -> String {
    format!("part-{writer:03}-{slot:03}.parquet")
}

// ============================================================================
// Staging
// ============================================================================

/// A sibling directory that disappears unless committed.
struct Staging {
    dir: PathBuf,
    root: PathBuf,
    committed: bool,
}

impl Staging {
    fn create(root: &Path) -> Result<Self> {
        if root.is_dir() && !root.join(MANIFEST_FILE).is_file() {
            let mut entries = fs::read_dir(root).map_err(|e| Error::io(root, e))?;
            if entries.next().is_some() {
                return Err(ConfigError::OutputNotEmpty(root.to_path_buf()).into());
            }
        }

        let parent = match root.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let dir = parent.join(format!(".{name}.partial"));

        if dir.exists() {
            warn!("Removing stale staging directory {}", dir.display());
            fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        Ok(Self {
            dir,
            root: root.to_path_buf(),
            committed: false,
        })
    }

    fn commit(mut self, manifest: &OutputManifest) -> Result<()> {
        let path = self.dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(&path, json).map_err(|e| Error::io(&path, e))?;

        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| Error::io(&self.root, e))?;
        }
        fs::rename(&self.dir, &self.root).map_err(|e| Error::io(&self.root, e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!("Failed to remove staging directory {}: {e}", self.dir.display());
            }
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

struct WriterReport {
    files: Vec<OutputFile>,
    partitions: u64,
}

/// Owns the writer threads and the staging directory for one output root.
pub struct PartitionedWriter {
    schema: Schema,
    config: WriterConfig,
    staging: Option<Staging>,
    senders: Vec<Sender<Partition>>,
    handles: Vec<Option<JoinHandle<Result<WriterReport>>>>,
}

impl PartitionedWriter {
    /// Prepare the staging directory and spawn `num_writers` writer threads.
    pub fn create(root: impl AsRef<Path>, schema: &Schema, config: &WriterConfig) -> Result<Self> {
        config.validate()?;
        let staging = Staging::create(root.as_ref())?;
        let arrow_schema = schema.arrow_schema();

        let mut senders = Vec::with_capacity(config.num_writers);
        let mut handles = Vec::with_capacity(config.num_writers);
        for id in 0..config.num_writers {
            let (tx, rx) = channel::bounded(config.channel_capacity);
            let dir = staging.dir.clone();
            let schema = Arc::clone(&arrow_schema);
            let files = config.files_per_writer;
            let handle = std::thread::Builder::new()
                .name(format!("writer-{id}"))
                .spawn(move || writer_loop(id, &dir, files, schema, rx))
                .map_err(Error::Spawn)?;
            senders.push(tx);
            handles.push(Some(handle));
        }

        info!(
            "Writing to {} ({} writers x {} files, shuffle={})",
            root.as_ref().display(),
            config.num_writers,
            config.files_per_writer,
            config.shuffle
        );

        Ok(Self {
            schema: schema.clone(),
            config: config.clone(),
            staging: Some(staging),
            senders,
            handles,
        })
    }

    /// A handle transform workers share to hand over partitions.
    pub fn sink(&self) -> PartitionSink<'_> {
        PartitionSink {
            senders: &self.senders,
            shuffle: self.config.shuffle,
            seed: self.config.seed,
        }
    }

    /// Close every file, write the manifest and move the output into place.
    pub fn finish(mut self) -> Result<OutputManifest> {
        let reports = self.join()?;
        let mut files: Vec<OutputFile> = reports.iter().flat_map(|r| r.files.iter().cloned()).collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let manifest = OutputManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            created_at: Utc::now(),
            num_rows: files.iter().map(|f| f.num_rows).sum(),
            num_partitions: reports.iter().map(|r| r.partitions).sum(),
            schema: self.schema.clone(),
            files,
        };
        if let Some(staging) = self.staging.take() {
            staging.commit(&manifest)?;
        }
        info!(
            "Wrote {} rows from {} partitions into {} files",
            manifest.num_rows,
            manifest.num_partitions,
            manifest.files.len()
        );
        Ok(manifest)
    }

    /// Stop the writers without committing. Returns the first writer failure, if
    /// any, which is usually the reason the pass gave up.
    pub fn abort(mut self) -> Result<()> {
        self.join().map(|_| ())
    }

    fn join(&mut self) -> Result<Vec<WriterReport>> {
        self.senders.clear();
        let mut reports = Vec::with_capacity(self.handles.len());
        let mut first_err = None;
        for (id, handle) in self.handles.iter_mut().enumerate() {
            let Some(handle) = handle.take() else { continue };
            match handle.join() {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(Error::WriterPanicked(id));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

impl Drop for PartitionedWriter {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            debug!("Writer error during drop: {e}");
        }
    }
}

/// Shared by transform workers. Shuffles on the calling thread, then blocks
/// until the receiving writer has room.
pub struct PartitionSink<'a> {
    senders: &'a [Sender<Partition>],
    shuffle: bool,
    seed: Option<u64>,
}

impl PartitionSink<'_> {
    /// Send the `batch`-th partition of read task `task`. The pair picks the
    /// writer and, with a configured seed, the shuffle permutation.
    pub fn send(&self, task: usize, batch: usize, partition: Partition) -> Result<()> {
        let partition = if self.shuffle {
            let mut rng = match self.seed {
                Some(seed) => SmallRng::seed_from_u64(partition_seed(seed, task, batch)),
                None => SmallRng::from_entropy(),
            };
            shuffle_rows(&partition, &mut rng)?
        } else {
            partition
        };
        let writer = (task + batch) % self.senders.len();
        self.senders[writer]
            .send(partition)
            .map_err(|_| Error::WriterDisconnected)
    }
}

fn partition_seed(seed: u64, task: usize, batch: usize) -> u64 {
    seed.wrapping_add((task as u64).wrapping_mul(1_000_003))
        .wrapping_add(batch as u64)
}

/// Uniform random permutation of a partition's rows.
pub fn shuffle_rows(partition: &Partition, rng: &mut SmallRng) -> Result<Partition> {
    let mut indices: Vec<u64> = (0..partition.num_rows() as u64).collect();
    indices.shuffle(rng);
    Ok(partition.take(&UInt64Array::from(indices))?)
}

/// Receives partitions until every sender is gone. Each partition is cut into
/// contiguous chunks spread over this writer's files, starting one file later
/// than the previous partition did. Files are created on first write, so a
/// writer that sees little data produces no empty files.
fn writer_loop(
    id: usize,
    dir: &Path,
    num_files: usize,
    schema: SchemaRef,
    rx: Receiver<Partition>,
) -> Result<WriterReport> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writers: Vec<Option<ArrowWriter<File>>> = (0..num_files).map(|_| None).collect();
    let mut rows = vec![0u64; num_files];
    let mut partitions = 0u64;
    let mut next_slot = 0usize;

    for partition in rx {
        partitions += 1;
        let n = partition.num_rows();
        if n == 0 {
            continue;
        }
        let chunk = n.div_ceil(num_files);
        for (j, offset) in (0..n).step_by(chunk).enumerate() {
            let slot = (next_slot + j) % num_files;
            let len = chunk.min(n - offset);
            let writer = match &mut writers[slot] {
                Some(w) => w,
                empty => {
                    let path = dir.join(file_name(id, slot));
                    let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
                    empty.insert(ArrowWriter::try_new(file, Arc::clone(&schema), Some(props.clone()))?)
                }
            };
            writer.write(&partition.slice(offset, len).into_batch()?)?;
            rows[slot] += len as u64;
        }
        next_slot = (next_slot + 1) % num_files;
    }

    let mut files = Vec::new();
    for (slot, writer) in writers.into_iter().enumerate() {
        if let Some(writer) = writer {
            writer.close()?;
            files.push(OutputFile {
                path: file_name(id, slot),
                writer: id,
                num_rows: rows[slot],
            });
        }
    }
    debug!("writer-{id}: {partitions} partitions into {} files", files.len());
    Ok(WriterReport { files, partitions })
}

// ============================================================================
// Tests
// ============================================================================
