//! The op pipeline: fill-missing, clip, log, normalize, categorify.
//!
//! Every op has a role tag that picks the columns it acts on and a transform
//! with its parameters. Stateless transforms only `apply`. Stateful ones also
//! `collect` partial statistics from a partition; those are merged across the
//! whole dataset and frozen by [`crate::stats`] before `apply` ever sees them.

use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float32Array, Int64Array};
use arrow::datatypes::Float32Type;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::common::{ColumnRole, Partition, Schema};
use crate::error::ConfigError;
use crate::stats::{Moments, OpStats, PartialStats, ValueCounts};

/// Floor on the standard deviation used by normalize.
pub const NORMALIZE_EPSILON: f64 = 1e-7;

// ============================================================================
// Roles
// ============================================================================

/// Which pipeline slot an op was added to.
///
/// Both continuous roles act on every continuous column; the categorical role
/// acts on every categorical column. Label columns are never touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpRole {
    ContinuousFeature,
    ContinuousPreprocess,
    CategoricalPreprocess,
}

impl OpRole {
    pub fn target(self) -> ColumnRole {
        match self {
            OpRole::ContinuousFeature | OpRole::ContinuousPreprocess => ColumnRole::Continuous,
            OpRole::CategoricalPreprocess => ColumnRole::Categorical,
        }
    }
}

impl fmt::Display for OpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpRole::ContinuousFeature => "continuous_feature",
            OpRole::ContinuousPreprocess => "continuous_preprocess",
            OpRole::CategoricalPreprocess => "categorical_preprocess",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Transforms
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Replace null and NaN with a constant.
    FillMissing {
        #[serde(default)]
        fill_value: f32,
    },
    /// Clamp into `[min_value, max_value]`. Either side may be open.
    Clip {
        #[serde(default)]
        min_value: Option<f32>,
        #[serde(default)]
        max_value: Option<f32>,
    },
    /// `ln(1 + x)`. Expects `x >= 0`, so usually runs after fill and clip.
    Log,
    /// `(x - mean) / max(std, eps)` with dataset-wide mean and std.
    Normalize,
    /// Map raw values to contiguous indices, folding rare values into the other bucket.
    Categorify {
        #[serde(default)]
        freq_threshold: u64,
    },
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::FillMissing { .. } => "fill_missing",
            Transform::Clip { .. } => "clip",
            Transform::Log => "log",
            Transform::Normalize => "normalize",
            Transform::Categorify { .. } => "categorify",
        }
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self, Transform::Normalize | Transform::Categorify { .. })
    }

    /// The column role this transform is defined for.
    pub fn target(&self) -> ColumnRole {
        match self {
            Transform::Categorify { .. } => ColumnRole::Categorical,
            _ => ColumnRole::Continuous,
        }
    }
}

// ============================================================================
// Op
// ============================================================================

/// One immutable pipeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub role: OpRole,
    pub transform: Transform,
}

impl Op {
    pub fn new(role: OpRole, transform: Transform) -> Self {
        Self { role, transform }
    }

    pub fn fill_missing(fill_value: f32) -> Self {
        Self::new(OpRole::ContinuousFeature, Transform::FillMissing { fill_value })
    }

    pub fn clip(min_value: Option<f32>, max_value: Option<f32>) -> Self {
        Self::new(
            OpRole::ContinuousFeature,
            Transform::Clip {
                min_value,
                max_value,
            },
        )
    }

    pub fn log() -> Self {
        Self::new(OpRole::ContinuousFeature, Transform::Log)
    }

    pub fn normalize() -> Self {
        Self::new(OpRole::ContinuousPreprocess, Transform::Normalize)
    }

    pub fn categorify(freq_threshold: u64) -> Self {
        Self::new(
            OpRole::CategoricalPreprocess,
            Transform::Categorify { freq_threshold },
        )
    }

    pub fn name(&self) -> &'static str {
        self.transform.name()
    }

    pub fn is_stateful(&self) -> bool {
        self.transform.is_stateful()
    }

    /// The column group this op reads and rewrites.
    pub fn group(&self) -> ColumnRole {
        self.role.target()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transform.target() != self.role.target() {
            return Err(ConfigError::IncompatibleRole {
                op: self.name(),
                role: self.role,
            });
        }
        match self.transform {
            Transform::FillMissing { fill_value } if !fill_value.is_finite() => {
                Err(ConfigError::NonFiniteFill(fill_value))
            }
            Transform::Clip {
                min_value: Some(min),
                max_value: Some(max),
            } if min > max => Err(ConfigError::InvalidClipRange { min, max }),
            _ => Ok(()),
        }
    }

    pub fn columns<'s>(&self, schema: &'s Schema) -> &'s [String] {
        schema.columns_with_role(self.group())
    }

    /// Partial statistics for one partition. `None` for stateless ops.
    ///
    /// A pure function of the partition: safe to call concurrently and in any order.
    pub fn collect(&self, schema: &Schema, partition: &Partition) -> Option<PartialStats> {
        match self.transform {
            Transform::Normalize => {
                let moments = self
                    .columns(schema)
                    .iter()
                    .map(|name| {
                        let mut m = Moments::default();
                        partition.continuous(name).iter().for_each(|v| m.observe(v));
                        (name.clone(), m)
                    })
                    .collect::<IndexMap<_, _>>();
                Some(PartialStats::Moments(moments))
            }
            Transform::Categorify { .. } => {
                let counts = self
                    .columns(schema)
                    .iter()
                    .map(|name| {
                        let mut c = ValueCounts::default();
                        partition.categorical(name).iter().for_each(|v| c.observe(v));
                        (name.clone(), c)
                    })
                    .collect::<IndexMap<_, _>>();
                Some(PartialStats::Counts(counts))
            }
            _ => None,
        }
    }

    /// Rewrite this op's columns. Row `i` of the output depends only on row `i` of the input.
    ///
    /// # Panics
    /// Panics if a stateful op is given no statistics, or statistics of the
    /// wrong kind, or statistics missing one of its columns. The workflow only
    /// calls `apply` with the frozen statistics produced for this op.
    pub fn apply(&self, schema: &Schema, mut partition: Partition, stats: Option<&OpStats>) -> Partition {
        for name in self.columns(schema) {
            let array: ArrayRef = match (&self.transform, stats) {
                (Transform::FillMissing { fill_value }, _) => {
                    Arc::new(fill_missing(partition.continuous(name), *fill_value))
                }
                (
                    Transform::Clip {
                        min_value,
                        max_value,
                    },
                    _,
                ) => Arc::new(clip(partition.continuous(name), *min_value, *max_value)),
                (Transform::Log, _) => Arc::new(
                    partition
                        .continuous(name)
                        .unary::<_, Float32Type>(f32::ln_1p),
                ),
                (Transform::Normalize, Some(OpStats::Normalize(stats))) => {
                    let s = stats
                        .get(name)
                        .unwrap_or_else(|| panic!("no continuous statistics for '{name}'"));
                    Arc::new(normalize(partition.continuous(name), s.mean, s.std))
                }
                (Transform::Categorify { .. }, Some(OpStats::Categorify(tables))) => {
                    let table = tables
                        .get(name)
                        .unwrap_or_else(|| panic!("no category table for '{name}'"));
                    let encoded: Int64Array = partition
                        .categorical(name)
                        .iter()
                        .map(|v| Some(table.index_of(v)))
                        .collect();
                    Arc::new(encoded)
                }
                (transform, _) => panic!(
                    "{} applied without matching frozen statistics",
                    transform.name()
                ),
            };
            partition.replace(name, array);
        }
        partition
    }
}

// ============================================================================
// Kernels
// ============================================================================

fn fill_missing(array: &Float32Array, fill_value: f32) -> Float32Array {
    array
        .iter()
        .map(|v| match v {
            Some(x) if !x.is_nan() => Some(x),
            _ => Some(fill_value),
        })
        .collect()
}

fn clip(array: &Float32Array, min_value: Option<f32>, max_value: Option<f32>) -> Float32Array {
    array.unary::<_, Float32Type>(|x| {
        // NaN counts as missing: leave it for fill-missing rather than pinning it to a bound
        if x.is_nan() {
            return x;
        }
        let x = min_value.map_or(x, |lo| x.max(lo));
        max_value.map_or(x, |hi| x.min(hi))
    })
}

fn normalize(array: &Float32Array, mean: f64, std: f64) -> Float32Array {
    let denom = std.max(NORMALIZE_EPSILON);
    array.unary::<_, Float32Type>(|x| ((x as f64 - mean) / denom) as f32)
}

/// Warn-worthy orderings. Normalize ahead of log on the same columns almost
/// always means the pipeline was assembled out of order.
pub(crate) fn order_warnings(ops: &[Op]) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut normalized_at = None;
    for (i, op) in ops.iter().enumerate() {
        match op.transform {
            Transform::Normalize => normalized_at = normalized_at.or(Some(i)),
            Transform::Log => {
                if let Some(n) = normalized_at {
                    warnings.push(format!(
                        "op {i} (log) runs after op {n} (normalize): log(1 + x) of normalized values is rarely intended"
                    ));
                }
            }
            _ => {}
        }
    }
    warnings
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::tests::{test_partition, test_schema};
    use crate::stats::{ContinuousStats, OpStats};

    fn run(ops: &[Op], partition: Partition) -> Partition {
        let schema = test_schema();
        ops.iter()
            .fold(partition, |p, op| op.apply(&schema, p, None))
    }

    #[test]
    fn test_fill_clip_log_composition() {
        let p = test_partition(
            vec![Some(-5.0), None, Some(f32::NAN), Some(0.0), Some(9.0)],
            vec![Some(1.0); 5],
            vec![Some(1); 5],
        );
        let ops = [Op::fill_missing(0.0), Op::clip(Some(0.0), None), Op::log()];
        let out = run(&ops, p);
        let i1 = out.continuous("I1");
        assert_eq!(i1.null_count(), 0);
        assert_eq!(i1.value(0), 0.0);
        assert_eq!(i1.value(1), 0.0);
        assert_eq!(i1.value(2), 0.0);
        assert_eq!(i1.value(3), 0.0);
        assert!((i1.value(4) - 10f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_stateless_ops_keep_nulls() {
        let p = test_partition(vec![None, Some(3.0)], vec![Some(-1.0), None], vec![None, None]);
        let out = run(&[Op::clip(Some(0.0), Some(2.0)), Op::log()], p);
        let i1 = out.continuous("I1");
        assert!(i1.is_null(0));
        assert!((i1.value(1) - 3f32.ln()).abs() < 1e-6);
        let i2 = out.continuous("I2");
        assert_eq!(i2.value(0), 0.0);
        assert!(i2.is_null(1));
        // labels and categoricals untouched
        assert!(out.categorical("C1").is_null(0));
    }

    #[test]
    fn test_clip_leaves_nan_missing() {
        let p = test_partition(
            vec![Some(f32::NAN), Some(-2.0), Some(9.0)],
            vec![Some(1.0); 3],
            vec![Some(1); 3],
        );
        let out = run(&[Op::clip(Some(0.0), Some(5.0))], p);
        let i1 = out.continuous("I1");
        assert!(i1.value(0).is_nan());
        assert_eq!(i1.value(1), 0.0);
        assert_eq!(i1.value(2), 5.0);

        // a later fill-missing still sees it
        let p = test_partition(vec![Some(f32::NAN)], vec![Some(1.0)], vec![Some(1)]);
        let out = run(&[Op::clip(Some(0.0), Some(5.0)), Op::fill_missing(3.0)], p);
        assert_eq!(out.continuous("I1").value(0), 3.0);
    }

    #[test]
    fn test_normalize_floors_std() {
        let schema = test_schema();
        let p = test_partition(vec![Some(4.0), None], vec![Some(2.0), Some(2.0)], vec![Some(1); 2]);
        let mut stats = IndexMap::new();
        stats.insert(
            "I1".to_string(),
            ContinuousStats {
                count: 2,
                num_nulls: 0,
                mean: 2.0,
                std: 2.0,
            },
        );
        stats.insert(
            "I2".to_string(),
            ContinuousStats {
                count: 2,
                num_nulls: 0,
                mean: 2.0,
                std: 0.0,
            },
        );
        let out = Op::normalize().apply(&schema, p, Some(&OpStats::Normalize(stats)));
        assert_eq!(out.continuous("I1").value(0), 1.0);
        assert!(out.continuous("I1").is_null(1));
        assert_eq!(out.continuous("I2").value(0), 0.0);
    }

    #[test]
    fn test_collect_only_for_stateful_ops() {
        let schema = test_schema();
        let p = test_partition(vec![Some(1.0)], vec![Some(2.0)], vec![Some(7)]);
        assert!(Op::log().collect(&schema, &p).is_none());
        assert!(Op::clip(None, None).collect(&schema, &p).is_none());
        assert!(matches!(
            Op::normalize().collect(&schema, &p),
            Some(PartialStats::Moments(m)) if m.len() == 2
        ));
        assert!(matches!(
            Op::categorify(0).collect(&schema, &p),
            Some(PartialStats::Counts(c)) if c.len() == 1
        ));
    }

    #[test]
    fn test_validate_rejects_bad_ops() {
        assert!(matches!(
            Op::new(OpRole::CategoricalPreprocess, Transform::Log).validate(),
            Err(ConfigError::IncompatibleRole { op: "log", .. })
        ));
        assert!(matches!(
            Op::new(OpRole::ContinuousPreprocess, Transform::Categorify { freq_threshold: 0 }).validate(),
            Err(ConfigError::IncompatibleRole { .. })
        ));
        assert!(matches!(
            Op::clip(Some(3.0), Some(1.0)).validate(),
            Err(ConfigError::InvalidClipRange { .. })
        ));
        assert!(Op::fill_missing(f32::NAN).validate().is_err());
        assert!(Op::clip(Some(0.0), None).validate().is_ok());
    }

    #[test]
    fn test_order_warnings() {
        assert!(order_warnings(&[Op::log(), Op::normalize()]).is_empty());
        assert_eq!(order_warnings(&[Op::normalize(), Op::log()]).len(), 1);
    }

    #[test]
    #[should_panic(expected = "without matching frozen statistics")]
    fn test_stateful_apply_requires_stats() {
        let p = test_partition(vec![Some(1.0)], vec![Some(2.0)], vec![Some(7)]);
        Op::categorify(0).apply(&test_schema(), p, None);
    }

    #[test]
    fn test_op_json_shape() {
        let json = r#"{"role":"continuous_feature","transform":{"kind":"clip","min_value":0.0}}"#;
        let op: Op = serde_json::from_str(json).unwrap();
        assert_eq!(op, Op::clip(Some(0.0), None));
    }
}
