//! Launching the external training binary against preprocessed outputs.
//!
//! The trainer is opaque: it receives the train/valid output roots, the
//! embedding sizes file and its own configuration path on the command line.
//! Everything it needs from preprocessing is checked before it is started, so
//! a missing manifest fails here rather than hours into a training job.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use millrace::embedding::{load_embedding_sizes, EMBEDDING_SIZES_FILE};
use millrace::OutputManifest;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{split} output at {path} is incomplete: {source}")]
    MissingOutput {
        split: &'static str,
        path: PathBuf,
        #[source]
        source: millrace::Error,
    },

    #[error("{split} output at {path} holds no rows")]
    EmptyOutput { split: &'static str, path: PathBuf },

    #[error("embedding sizes at {path} are unusable: {source}")]
    EmbeddingSizes {
        path: PathBuf,
        #[source]
        source: millrace::Error,
    },

    #[error("train and valid outputs were written with different schemas")]
    SchemaMismatch,

    #[error("embedding sizes do not cover categorical column '{0}'")]
    MissingEmbedding(String),

    #[error("trainer config {0} does not exist")]
    MissingConfig(PathBuf),

    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("trainer exited with {0}")]
    Failed(ExitStatus),
}

/// What preprocessing produced, as verified before launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSummary {
    pub train_rows: u64,
    pub valid_rows: Option<u64>,
    pub num_categorical: usize,
}

/// One invocation of the training binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerLaunch {
    pub binary: PathBuf,
    pub config: PathBuf,
    pub train_dir: PathBuf,
    pub valid_dir: Option<PathBuf>,
    pub embedding_sizes: PathBuf,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl TrainerLaunch {
    /// The standard layout `preprocess` writes under one output root.
    /// The valid split is used only if it was written.
    pub fn from_output_dir(binary: impl Into<PathBuf>, config: impl Into<PathBuf>, output: impl AsRef<Path>) -> Self {
        let output = output.as_ref();
        let valid = output.join("valid");
        Self {
            binary: binary.into(),
            config: config.into(),
            train_dir: output.join("train"),
            valid_dir: valid.is_dir().then_some(valid),
            embedding_sizes: output.join(EMBEDDING_SIZES_FILE),
            extra_args: Vec::new(),
        }
    }

    /// Check that every input the trainer reads exists and is complete.
    pub fn validate(&self) -> Result<LaunchSummary, LaunchError> {
        if !self.config.is_file() {
            return Err(LaunchError::MissingConfig(self.config.clone()));
        }

        let train = load_manifest("train", &self.train_dir)?;
        let valid = self
            .valid_dir
            .as_ref()
            .map(|dir| load_manifest("valid", dir))
            .transpose()?;
        if let Some(valid) = &valid {
            if valid.schema != train.schema {
                return Err(LaunchError::SchemaMismatch);
            }
        }

        let sizes = load_embedding_sizes(&self.embedding_sizes).map_err(|source| LaunchError::EmbeddingSizes {
            path: self.embedding_sizes.clone(),
            source,
        })?;
        if let Some(missing) = train.schema.categorical.iter().find(|c| !sizes.contains_key(*c)) {
            return Err(LaunchError::MissingEmbedding(missing.clone()));
        }

        Ok(LaunchSummary {
            train_rows: train.num_rows,
            valid_rows: valid.map(|m| m.num_rows),
            num_categorical: sizes.len(),
        })
    }

    /// The command line, without running it.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--config")
            .arg(&self.config)
            .arg("--train-dir")
            .arg(&self.train_dir)
            .arg("--embedding-sizes")
            .arg(&self.embedding_sizes);
        if let Some(valid) = &self.valid_dir {
            cmd.arg("--valid-dir").arg(valid);
        }
        cmd.args(&self.extra_args);
        cmd
    }

    /// Validate, then run the trainer to completion.
    pub fn run(&self) -> Result<LaunchSummary, LaunchError> {
        let summary = self.validate()?;
        info!(
            "Launching {} on {} train rows{}",
            self.binary.display(),
            summary.train_rows,
            summary
                .valid_rows
                .map(|n| format!(", {n} valid rows"))
                .unwrap_or_default()
        );
        let status = self
            .command()
            .status()
            .map_err(|source| LaunchError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;
        if !status.success() {
            return Err(LaunchError::Failed(status));
        }
        info!("Trainer finished");
        Ok(summary)
    }
}

fn load_manifest(split: &'static str, dir: &Path) -> Result<OutputManifest, LaunchError> {
    let manifest = OutputManifest::load(dir).map_err(|source| LaunchError::MissingOutput {
        split,
        path: dir.to_path_buf(),
        source,
    })?;
    if manifest.num_rows == 0 {
        return Err(LaunchError::EmptyOutput {
            split,
            path: dir.to_path_buf(),
        });
    }
    Ok(manifest)
}
