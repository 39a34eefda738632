//! Schema, partitions, and memory budgeting shared by every pass.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float32Array, Int64Array, UInt64Array};
use arrow::compute::take;
use arrow::datatypes::{DataType, Field, Float32Type, Int64Type, Schema as ArrowSchema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::warn;

use crate::error::ConfigError;

// ============================================================================
// Reserved category indices
// ============================================================================

/// Index every null categorical value maps to.
pub const MISSING_INDEX: i64 = 0;

/// Index shared by below-threshold values at fit time and unseen values at transform time.
pub const OTHER_INDEX: i64 = 1;

/// First index handed out to a kept category.
pub const FIRST_CATEGORY_INDEX: i64 = 2;

/// Number of reserved indices at the bottom of every category table.
pub const RESERVED_INDICES: usize = 2;

// ============================================================================
// Schema
// ============================================================================

/// The role a column plays in the workflow. Fixed for the lifetime of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Continuous,
    Categorical,
    Label,
}

impl ColumnRole {
    /// The Arrow type a column of this role is coerced to at read time.
    pub fn data_type(self) -> DataType {
        match self {
            ColumnRole::Continuous | ColumnRole::Label => DataType::Float32,
            ColumnRole::Categorical => DataType::Int64,
        }
    }

    /// Decoded bytes per value, used to turn a byte budget into a row budget.
    pub fn width_bytes(self) -> usize {
        match self {
            ColumnRole::Continuous | ColumnRole::Label => std::mem::size_of::<f32>(),
            ColumnRole::Categorical => std::mem::size_of::<i64>(),
        }
    }
}

/// Ordered column names split into three disjoint roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub continuous: Vec<String>,
    #[serde(default)]
    pub categorical: Vec<String>,
    #[serde(default)]
    pub label: Vec<String>,
}

impl Schema {
    /// Build and validate a schema.
    pub fn new<S: Into<String>>(
        continuous: impl IntoIterator<Item = S>,
        categorical: impl IntoIterator<Item = S>,
        label: impl IntoIterator<Item = S>,
    ) -> Result<Self, ConfigError> {
        let schema = Self {
            continuous: continuous.into_iter().map(Into::into).collect(),
            categorical: categorical.into_iter().map(Into::into).collect(),
            label: label.into_iter().map(Into::into).collect(),
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Every name must be unique across roles, non-empty, and usable as a file name
    /// (frozen statistics are stored one file per column).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.continuous.is_empty() && self.categorical.is_empty() {
            return Err(ConfigError::EmptySchema);
        }
        let mut seen = std::collections::HashSet::new();
        for (name, _) in self.columns() {
            if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
                return Err(ConfigError::InvalidColumnName(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateColumn(name.to_string()));
            }
        }
        Ok(())
    }

    /// All columns in storage order: continuous, then categorical, then label.
    pub fn columns(&self) -> impl Iterator<Item = (&str, ColumnRole)> {
        fn tag(names: &[String], role: ColumnRole) -> impl Iterator<Item = (&str, ColumnRole)> {
            names.iter().map(move |n| (n.as_str(), role))
        }
        tag(&self.continuous, ColumnRole::Continuous)
            .chain(tag(&self.categorical, ColumnRole::Categorical))
            .chain(tag(&self.label, ColumnRole::Label))
    }

    pub fn columns_with_role(&self, role: ColumnRole) -> &[String] {
        match role {
            ColumnRole::Continuous => &self.continuous,
            ColumnRole::Categorical => &self.categorical,
            ColumnRole::Label => &self.label,
        }
    }

    pub fn role_of(&self, name: &str) -> Option<ColumnRole> {
        self.columns().find(|(n, _)| *n == name).map(|(_, role)| role)
    }

    pub fn len(&self) -> usize {
        self.continuous.len() + self.categorical.len() + self.label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The coerced Arrow schema every partition carries. All fields are nullable.
    pub fn arrow_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns()
            .map(|(name, role)| Field::new(name, role.data_type(), true))
            .collect();
        Arc::new(ArrowSchema::new(fields))
    }

    /// Decoded bytes per row.
    pub fn row_width_bytes(&self) -> usize {
        self.columns().map(|(_, role)| role.width_bytes()).sum()
    }
}

// ============================================================================
// Partition
// ============================================================================

/// A bounded chunk of rows, typed per the [`Schema`].
///
/// Partitions are transient: a pass reads one, hands it through the op pipeline,
/// then either folds it into statistics or writes it out. Nothing keeps a
/// partition alive across passes.
#[derive(Debug, Clone)]
pub struct Partition {
    schema: SchemaRef,
    columns: Vec<ArrayRef>,
    num_rows: usize,
}

impl Partition {
    pub fn from_batch(batch: RecordBatch) -> Self {
        Self {
            schema: batch.schema(),
            num_rows: batch.num_rows(),
            columns: batch.columns().to_vec(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        let idx = self.schema.index_of(name).ok()?;
        Some(&self.columns[idx])
    }

    /// Typed access to a continuous (or label) column.
    ///
    /// # Panics
    /// Panics if the column is absent or not `Float32`. Partitions produced by
    /// the partition source always carry every schema column with its coerced type.
    pub fn continuous(&self, name: &str) -> &Float32Array {
        self.column(name)
            .unwrap_or_else(|| panic!("partition has no column '{name}'"))
            .as_primitive::<Float32Type>()
    }

    /// Typed access to a categorical column.
    ///
    /// # Panics
    /// Panics if the column is absent or not `Int64`.
    pub fn categorical(&self, name: &str) -> &Int64Array {
        self.column(name)
            .unwrap_or_else(|| panic!("partition has no column '{name}'"))
            .as_primitive::<Int64Type>()
    }

    /// Swap in a transformed column.
    ///
    /// # Panics
    /// Panics if the column is absent, or if the replacement has a different
    /// length or type than the column it replaces.
    pub fn replace(&mut self, name: &str, array: ArrayRef) {
        let idx = self
            .schema
            .index_of(name)
            .unwrap_or_else(|_| panic!("partition has no column '{name}'"));
        assert_eq!(
            array.len(),
            self.num_rows,
            "replacement for '{name}' has {} rows, partition has {}",
            array.len(),
            self.num_rows,
        );
        assert_eq!(
            array.data_type(),
            self.schema.field(idx).data_type(),
            "replacement for '{name}' changes the column type",
        );
        self.columns[idx] = array;
    }

    /// Gather rows by position (used for the intra-partition shuffle).
    pub fn take(&self, indices: &UInt64Array) -> Result<Self, ArrowError> {
        let columns = self
            .columns
            .iter()
            .map(|c| take(c.as_ref(), indices, None))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema: Arc::clone(&self.schema),
            columns,
            num_rows: indices.len(),
        })
    }

    /// Zero-copy row range.
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            columns: self.columns.iter().map(|c| c.slice(offset, len)).collect(),
            num_rows: len,
        }
    }

    pub fn into_batch(self) -> Result<RecordBatch, ArrowError> {
        RecordBatch::try_new(self.schema, self.columns)
    }

    /// Bytes held by the partition's buffers.
    pub fn memory_size(&self) -> usize {
        self.columns.iter().map(|c| c.get_array_memory_size()).sum()
    }
}

// ============================================================================
// Memory budget
// ============================================================================

/// Host memory assumed when the platform reports none.
const FALLBACK_HOST_BYTES: u64 = 8 << 30;

/// The byte budget for a single partition: a fraction of host memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBudget {
    fraction: f64,
    total_bytes: u64,
}

impl MemoryBudget {
    /// Budget against the memory installed on this host.
    pub fn from_host(fraction: f64) -> Result<Self, ConfigError> {
        let mut system = System::new();
        system.refresh_memory();
        let mut total_bytes = system.total_memory();
        if total_bytes == 0 {
            warn!(
                "Host memory size unavailable, assuming {} bytes",
                FALLBACK_HOST_BYTES
            );
            total_bytes = FALLBACK_HOST_BYTES;
        }
        Self::with_total_bytes(fraction, total_bytes)
    }

    /// Budget against an explicit memory size.
    pub fn with_total_bytes(fraction: f64, total_bytes: u64) -> Result<Self, ConfigError> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::InvalidMemoryFraction(fraction));
        }
        Ok(Self {
            fraction,
            total_bytes,
        })
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn bytes(&self) -> u64 {
        (self.fraction * self.total_bytes as f64) as u64
    }

    /// How many rows of `schema` fit in the budget. Never less than one.
    pub fn rows_for(&self, schema: &Schema) -> usize {
        let width = schema.row_width_bytes().max(1) as u64;
        (self.bytes() / width).clamp(1, usize::MAX as u64) as usize
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// `I1, I2` continuous, `C1` categorical, `label` label.
    pub(crate) fn test_schema() -> Schema {
        Schema::new(["I1", "I2"], ["C1"], ["label"]).unwrap()
    }

    /// Build a partition for [`test_schema`].
    pub(crate) fn test_partition(
        i1: Vec<Option<f32>>,
        i2: Vec<Option<f32>>,
        c1: Vec<Option<i64>>,
    ) -> Partition {
        let n = c1.len();
        let labels: Float32Array = (0..n).map(|i| Some((i % 2) as f32)).collect();
        let batch = RecordBatch::try_new(
            test_schema().arrow_schema(),
            vec![
                Arc::new(Float32Array::from(i1)),
                Arc::new(Float32Array::from(i2)),
                Arc::new(Int64Array::from(c1)),
                Arc::new(labels),
            ],
        )
        .unwrap();
        Partition::from_batch(batch)
    }

    #[test]
    fn test_schema_rejects_duplicate_roles() {
        let err = Schema::new(["a", "b"], ["b"], Vec::<&str>::new()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateColumn(name) if name == "b"));
    }

    #[test]
    fn test_schema_rejects_bad_names() {
        assert!(matches!(
            Schema::new([""], ["c"], ["l"]),
            Err(ConfigError::InvalidColumnName(_))
        ));
        assert!(matches!(
            Schema::new(["a/b"], ["c"], ["l"]),
            Err(ConfigError::InvalidColumnName(_))
        ));
        assert!(matches!(
            Schema::new(Vec::<&str>::new(), Vec::new(), vec!["label"]),
            Err(ConfigError::EmptySchema)
        ));
    }

    #[test]
    fn test_arrow_schema_coerces_roles() {
        let schema = test_schema();
        let arrow = schema.arrow_schema();
        let types: Vec<_> = arrow.fields().iter().map(|f| f.data_type().clone()).collect();
        assert_eq!(
            types,
            vec![
                DataType::Float32,
                DataType::Float32,
                DataType::Int64,
                DataType::Float32
            ]
        );
        assert_eq!(schema.row_width_bytes(), 4 + 4 + 8 + 4);
        assert_eq!(schema.role_of("C1"), Some(ColumnRole::Categorical));
        assert_eq!(schema.role_of("nope"), None);
    }

    #[test]
    fn test_memory_budget_bounds() {
        assert!(MemoryBudget::with_total_bytes(0.0, 1024).is_err());
        assert!(MemoryBudget::with_total_bytes(1.5, 1024).is_err());
        assert!(MemoryBudget::with_total_bytes(f64::NAN, 1024).is_err());

        let schema = test_schema();
        let budget = MemoryBudget::with_total_bytes(0.5, 200).unwrap();
        assert_eq!(budget.bytes(), 100);
        assert_eq!(budget.rows_for(&schema), 5);

        let tiny = MemoryBudget::with_total_bytes(0.01, 10).unwrap();
        assert_eq!(tiny.rows_for(&schema), 1);
    }

    #[test]
    fn test_partition_take_and_slice() {
        let p = test_partition(
            vec![Some(1.0), Some(2.0), Some(3.0)],
            vec![None, Some(5.0), Some(6.0)],
            vec![Some(10), Some(20), None],
        );
        let taken = p.take(&UInt64Array::from(vec![2u64, 0, 1])).unwrap();
        assert_eq!(taken.num_rows(), 3);
        assert_eq!(taken.continuous("I1").values().to_vec(), vec![3.0, 1.0, 2.0]);
        assert!(taken.categorical("C1").is_null(0));

        let sliced = p.slice(1, 2);
        assert_eq!(sliced.num_rows(), 2);
        assert_eq!(sliced.categorical("C1").value(0), 20);
        assert_eq!(sliced.into_batch().unwrap().num_rows(), 2);
    }

    #[test]
    #[should_panic(expected = "changes the column type")]
    fn test_partition_replace_checks_type() {
        let mut p = test_partition(vec![Some(1.0)], vec![Some(2.0)], vec![Some(3)]);
        p.replace("I1", Arc::new(Int64Array::from(vec![1i64])));
    }
}
