//! Embedding widths for categorical columns, derived from their final cardinality.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, Result};
use crate::stats::FrozenStats;

pub const EMBEDDING_SIZES_FILE: &str = "embedding_sizes.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    Ceil,
    Nearest,
}

/// `clamp(round(scale * V^exponent), 1, cap)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSizeEstimator {
    pub cap: usize,
    pub scale: f64,
    pub exponent: f64,
    pub rounding: Rounding,
}

impl Default for EmbeddingSizeEstimator {
    fn default() -> Self {
        Self {
            cap: 16,
            scale: 1.0,
            exponent: 0.25,
            rounding: Rounding::Ceil,
        }
    }
}

impl EmbeddingSizeEstimator {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cap == 0 {
            return Err(ConfigError::Zero("embedding cap"));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(ConfigError::InvalidEmbedding(format!(
                "scale must be positive and finite, got {}",
                self.scale
            )));
        }
        if !(self.exponent.is_finite() && self.exponent >= 0.0) {
            return Err(ConfigError::InvalidEmbedding(format!(
                "exponent must be non-negative and finite, got {}",
                self.exponent
            )));
        }
        Ok(())
    }

    /// Width for a column with `cardinality` distinct indices. Always in `[1, cap]`.
    pub fn estimate(&self, cardinality: usize) -> usize {
        let raw = self.scale * (cardinality as f64).powf(self.exponent);
        let rounded = match self.rounding {
            Rounding::Ceil => raw.ceil(),
            Rounding::Nearest => raw.round(),
        };
        if !rounded.is_finite() || rounded < 1.0 {
            return 1;
        }
        (rounded.min(self.cap as f64) as usize).max(1)
    }

    /// One entry per categorical column with a frozen category table.
    pub fn estimate_all(&self, frozen: &FrozenStats) -> IndexMap<String, EmbeddingSize> {
        frozen
            .category_tables()
            .into_iter()
            .map(|(name, table)| {
                let cardinality = table.cardinality();
                (
                    name.to_string(),
                    EmbeddingSize {
                        cardinality,
                        dimension: self.estimate(cardinality),
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSize {
    pub cardinality: usize,
    pub dimension: usize,
}

pub fn write_embedding_sizes(path: impl AsRef<Path>, sizes: &IndexMap<String, EmbeddingSize>) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(sizes)?;
    fs::write(path, json).map_err(|e| Error::io(path, e))
}

pub fn load_embedding_sizes(path: impl AsRef<Path>) -> Result<IndexMap<String, EmbeddingSize>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&text).map_err(|source| {
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
        .into()
    })
}
