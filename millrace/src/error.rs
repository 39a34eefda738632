//! Error types for the transformation engine.
//!
//! Errors fall into three fatal families: configuration problems caught before
//! any pass starts, state problems (transforming an unfit workflow, fitting a
//! fit one), and I/O failures that abort the running pass. Bad *data* is never
//! an error: unseen categories and out-of-range values resolve to the other
//! bucket or the clip bounds.

use std::path::{Path, PathBuf};

use arrow::datatypes::DataType;
use thiserror::Error;

use crate::ops::OpRole;

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("column names must be non-empty and must not contain path separators, got '{0}'")]
    InvalidColumnName(String),

    #[error("column '{0}' is assigned to more than one role")]
    DuplicateColumn(String),

    #[error("schema has no continuous or categorical columns")]
    EmptySchema,

    #[error("op '{op}' cannot run with role {role}")]
    IncompatibleRole { op: &'static str, role: OpRole },

    #[error("clip range is empty: min {min} > max {max}")]
    InvalidClipRange { min: f32, max: f32 },

    #[error("fill value must be finite, got {0}")]
    NonFiniteFill(f32),

    #[error("memory fraction must be in (0, 1], got {0}")]
    InvalidMemoryFraction(f64),

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("invalid embedding heuristic: {0}")]
    InvalidEmbedding(String),

    #[error("no input files found in {0}")]
    NoInputFiles(PathBuf),

    #[error("input file {path} has no column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    #[error("column '{column}' in {path} has type {found}, which cannot be read as {expected}")]
    UncastableColumn {
        path: PathBuf,
        column: String,
        found: DataType,
        expected: DataType,
    },

    #[error("output directory {0} is not empty and holds no previous output manifest")]
    OutputNotEmpty(PathBuf),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Workflow state
// ============================================================================

#[derive(Debug, Error)]
pub enum StateError {
    #[error("workflow is not fit: run apply with record_stats (or fit) on the training data first")]
    NotFit,

    #[error("workflow is already fit: call refit() to discard the frozen statistics and fit again")]
    AlreadyFit,

    #[error("saved statistics do not match this workflow: {0}")]
    Mismatch(String),

    #[error("unsupported statistics format version {found} (expected {expected})")]
    FormatVersion { found: u32, expected: u32 },
}

// ============================================================================
// Top-level error
// ============================================================================

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to spawn writer thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("output writers stopped before the transform pass finished")]
    WriterDisconnected,

    #[error("writer thread {0} panicked")]
    WriterPanicked(usize),
}

impl Error {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}
