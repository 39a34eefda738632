//! JSON workflow description: schema, op pipeline, partition budget, run
//! options and the embedding heuristic.
//!
//! ```json
//! {
//!   "schema": { "continuous": ["I1"], "categorical": ["C1"], "label": ["label"] },
//!   "ops": [
//!     { "role": "continuous_feature", "transform": { "kind": "fill_missing", "fill_value": 0.0 } },
//!     { "role": "continuous_feature", "transform": { "kind": "clip", "min_value": 0.0 } },
//!     { "role": "continuous_feature", "transform": { "kind": "log" } },
//!     { "role": "continuous_preprocess", "transform": { "kind": "normalize" } },
//!     { "role": "categorical_preprocess", "transform": { "kind": "categorify", "freq_threshold": 15 } }
//!   ],
//!   "partition": { "memory_fraction": 0.1 },
//!   "run": { "num_workers": 8, "writer": { "num_writers": 2, "files_per_writer": 8 } }
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::{MemoryBudget, Schema};
use crate::embedding::EmbeddingSizeEstimator;
use crate::error::{ConfigError, Error, Result};
use crate::ops::Op;
use crate::workflow::{RunOptions, Workflow};

/// Sizing of the partitions every pass reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Fraction of host memory one partition may occupy, in `(0, 1]`.
    pub memory_fraction: f64,
    /// Host memory to budget against. Measured when absent.
    pub host_memory_bytes: Option<u64>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            memory_fraction: 0.1,
            host_memory_bytes: None,
        }
    }
}

impl PartitionConfig {
    pub fn budget(&self) -> Result<MemoryBudget, ConfigError> {
        match self.host_memory_bytes {
            Some(bytes) => MemoryBudget::with_total_bytes(self.memory_fraction, bytes),
            None => MemoryBudget::from_host(self.memory_fraction),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub schema: Schema,
    pub ops: Vec<Op>,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub run: RunOptions,
    #[serde(default)]
    pub embedding: EmbeddingSizeEstimator,
}

impl WorkflowConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Everything that can be checked before touching any data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schema.validate()?;
        for op in &self.ops {
            op.validate()?;
        }
        let fraction = self.partition.memory_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::InvalidMemoryFraction(fraction));
        }
        self.run.writer.validate()?;
        self.embedding.validate()
    }

    /// An unfit workflow with this config's run options.
    pub fn build(&self) -> Result<Workflow> {
        Workflow::new(self.schema.clone(), self.ops.clone())?.with_options(self.run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Rounding;
    use crate::ops::{OpRole, Transform};

    const EXAMPLE: &str = r#"{
        "schema": { "continuous": ["I1", "I2"], "categorical": ["C1"], "label": ["label"] },
        "ops": [
            { "role": "continuous_feature", "transform": { "kind": "fill_missing", "fill_value": 0.0 } },
            { "role": "continuous_feature", "transform": { "kind": "clip", "min_value": 0.0 } },
            { "role": "continuous_feature", "transform": { "kind": "log" } },
            { "role": "continuous_preprocess", "transform": { "kind": "normalize" } },
            { "role": "categorical_preprocess", "transform": { "kind": "categorify", "freq_threshold": 15 } }
        ],
        "partition": { "memory_fraction": 0.25, "host_memory_bytes": 4096 },
        "run": { "num_workers": 3, "writer": { "files_per_writer": 8, "seed": 5 } },
        "embedding": { "rounding": "nearest" }
    }"#;

    #[test]
    fn test_parse_example() {
        let config = WorkflowConfig::from_json(EXAMPLE).unwrap();
        assert_eq!(config.ops.len(), 5);
        assert_eq!(config.ops[4], Op::categorify(15));
        assert_eq!(config.ops[1], Op::new(OpRole::ContinuousFeature, Transform::Clip { min_value: Some(0.0), max_value: None }));
        assert_eq!(config.run.num_workers, 3);
        assert_eq!(config.run.writer.files_per_writer, 8);
        assert_eq!(config.run.writer.num_writers, 2);
        assert_eq!(config.run.writer.seed, Some(5));
        assert_eq!(config.embedding.rounding, Rounding::Nearest);
        assert_eq!(config.embedding.cap, 16);
        assert_eq!(config.partition.budget().unwrap().bytes(), 1024);

        let workflow = config.build().unwrap();
        assert!(!workflow.is_fit());
        assert_eq!(workflow.options().writer.seed, Some(5));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let bad_fraction = EXAMPLE.replace("0.25", "1.5");
        assert!(matches!(
            WorkflowConfig::from_json(&bad_fraction),
            Err(Error::Config(ConfigError::InvalidMemoryFraction(_)))
        ));

        let bad_role = EXAMPLE.replace(r#""role": "categorical_preprocess""#, r#""role": "continuous_preprocess""#);
        assert!(matches!(
            WorkflowConfig::from_json(&bad_role),
            Err(Error::Config(ConfigError::IncompatibleRole { .. }))
        ));

        let dup = EXAMPLE.replace(r#""label": ["label"]"#, r#""label": ["C1"]"#);
        assert!(matches!(
            WorkflowConfig::from_json(&dup),
            Err(Error::Config(ConfigError::DuplicateColumn(_)))
        ));

        let no_writers = EXAMPLE.replace(r#""files_per_writer": 8"#, r#""files_per_writer": 0"#);
        assert!(matches!(
            WorkflowConfig::from_json(&no_writers),
            Err(Error::Config(ConfigError::Zero("files_per_writer")))
        ));
    }

    #[test]
    fn test_from_path_reports_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("workflow.json");
        fs::write(&path, "{ not json").unwrap();
        match WorkflowConfig::from_path(&path) {
            Err(Error::Config(ConfigError::Parse { path: p, .. })) => assert_eq!(p, path),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            WorkflowConfig::from_path(dir.path().join("missing.json")),
            Err(Error::Io { .. })
        ));
    }
}
