//! Partial statistics, their merge, and the frozen tables they become.
//!
//! Every partial result merges with an associative, commutative combinator
//! (counts and sums add, value-count maps union), so the frozen tables do not
//! depend on how the dataset was partitioned or in which order the partial
//! results arrived.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::common::{Schema, FIRST_CATEGORY_INDEX, MISSING_INDEX, OTHER_INDEX, RESERVED_INDICES};
use crate::ops::{Op, Transform};

// ============================================================================
// Continuous moments
// ============================================================================

/// Running count, sum and sum of squares over the non-null finite values of a column.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    pub num_nulls: u64,
}

impl Moments {
    pub fn observe(&mut self, value: Option<f32>) {
        match value {
            Some(v) if v.is_finite() => {
                let v = v as f64;
                self.count += 1;
                self.sum += v;
                self.sum_sq += v * v;
            }
            _ => self.num_nulls += 1,
        }
    }

    pub fn merge(&mut self, other: &Moments) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.num_nulls += other.num_nulls;
    }

    pub fn freeze(&self) -> ContinuousStats {
        if self.count == 0 {
            return ContinuousStats {
                count: 0,
                num_nulls: self.num_nulls,
                mean: 0.0,
                std: 0.0,
            };
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        ContinuousStats {
            count: self.count,
            num_nulls: self.num_nulls,
            mean,
            std: variance.sqrt(),
        }
    }
}

/// Frozen per-column statistics consumed by normalize.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContinuousStats {
    pub count: u64,
    pub num_nulls: u64,
    pub mean: f64,
    pub std: f64,
}

// ============================================================================
// Category counts
// ============================================================================

/// Raw value → occurrence count, plus the nulls seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueCounts {
    pub counts: HashMap<i64, u64>,
    pub num_nulls: u64,
}

impl ValueCounts {
    pub fn observe(&mut self, value: Option<i64>) {
        match value {
            Some(v) => *self.counts.entry(v).or_insert(0) += 1,
            None => self.num_nulls += 1,
        }
    }

    pub fn merge(&mut self, mut other: ValueCounts) {
        if other.counts.len() > self.counts.len() {
            std::mem::swap(&mut self.counts, &mut other.counts);
        }
        for (value, count) in other.counts {
            *self.counts.entry(value).or_insert(0) += count;
        }
        self.num_nulls += other.num_nulls;
    }

    /// Sort by count descending (ties by raw value ascending) and fold every
    /// value below `freq_threshold` into the other bucket.
    pub fn freeze(&self, freq_threshold: u64) -> CategoryTable {
        let mut ranked: Vec<(i64, u64)> = self.counts.iter().map(|(&v, &c)| (v, c)).collect();
        ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let split = ranked.partition_point(|&(_, count)| count >= freq_threshold);
        let num_other = ranked[split..].iter().map(|&(_, c)| c).sum();
        ranked.truncate(split);

        let (categories, counts) = ranked.into_iter().unzip();
        CategoryTable::from_parts(freq_threshold, self.num_nulls, num_other, categories, counts)
    }
}

// ============================================================================
// Category table
// ============================================================================

/// Frozen raw value → contiguous index mapping for one categorical column.
///
/// Index 0 is missing, index 1 is the other bucket, and the kept categories
/// follow from index 2 in frequency order. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CategoryTableRepr", into = "CategoryTableRepr")]
pub struct CategoryTable {
    freq_threshold: u64,
    num_nulls: u64,
    num_other: u64,
    categories: Vec<i64>,
    counts: Vec<u64>,
    lookup: HashMap<i64, usize>,
}

impl PartialEq for CategoryTable {
    fn eq(&self, other: &Self) -> bool {
        self.freq_threshold == other.freq_threshold
            && self.num_nulls == other.num_nulls
            && self.num_other == other.num_other
            && self.categories == other.categories
            && self.counts == other.counts
    }
}

impl CategoryTable {
    fn from_parts(
        freq_threshold: u64,
        num_nulls: u64,
        num_other: u64,
        categories: Vec<i64>,
        counts: Vec<u64>,
    ) -> Self {
        let lookup = categories.iter().enumerate().map(|(i, &v)| (v, i)).collect();
        Self {
            freq_threshold,
            num_nulls,
            num_other,
            categories,
            counts,
            lookup,
        }
    }

    /// Never fails: null is [`MISSING_INDEX`], anything not kept is [`OTHER_INDEX`].
    #[inline]
    pub fn index_of(&self, value: Option<i64>) -> i64 {
        match value {
            None => MISSING_INDEX,
            Some(v) => self
                .lookup
                .get(&v)
                .map_or(OTHER_INDEX, |&i| FIRST_CATEGORY_INDEX + i as i64),
        }
    }

    /// Number of distinct output indices, reserved ones included.
    pub fn cardinality(&self) -> usize {
        self.categories.len() + RESERVED_INDICES
    }

    /// Kept raw values in index order (the first maps to index 2).
    pub fn categories(&self) -> &[i64] {
        &self.categories
    }

    /// Fit-time count of each kept category, aligned with [`Self::categories`].
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn freq_threshold(&self) -> u64 {
        self.freq_threshold
    }

    pub fn num_nulls(&self) -> u64 {
        self.num_nulls
    }

    /// Rows folded into the other bucket at fit time.
    pub fn num_other(&self) -> u64 {
        self.num_other
    }
}

#[derive(Serialize, Deserialize)]
struct CategoryTableRepr {
    freq_threshold: u64,
    num_nulls: u64,
    num_other: u64,
    categories: Vec<i64>,
    counts: Vec<u64>,
}

impl TryFrom<CategoryTableRepr> for CategoryTable {
    type Error = String;

    fn try_from(repr: CategoryTableRepr) -> Result<Self, Self::Error> {
        if repr.categories.len() != repr.counts.len() {
            return Err(format!(
                "{} categories but {} counts",
                repr.categories.len(),
                repr.counts.len()
            ));
        }
        let table = Self::from_parts(
            repr.freq_threshold,
            repr.num_nulls,
            repr.num_other,
            repr.categories,
            repr.counts,
        );
        if table.lookup.len() != table.categories.len() {
            return Err("duplicate category value".to_string());
        }
        Ok(table)
    }
}

impl From<CategoryTable> for CategoryTableRepr {
    fn from(table: CategoryTable) -> Self {
        Self {
            freq_threshold: table.freq_threshold,
            num_nulls: table.num_nulls,
            num_other: table.num_other,
            categories: table.categories,
            counts: table.counts,
        }
    }
}

// ============================================================================
// Per-op statistics
// ============================================================================

/// What one stateful op collected from one or more partitions.
#[derive(Debug, Clone, PartialEq)]
pub enum PartialStats {
    Moments(IndexMap<String, Moments>),
    Counts(IndexMap<String, ValueCounts>),
}

impl PartialStats {
    /// Nothing observed yet, for an op whose pass saw no partitions.
    pub fn empty(transform: &Transform, columns: &[String]) -> Option<Self> {
        match transform {
            Transform::Normalize => Some(PartialStats::Moments(
                columns.iter().map(|c| (c.clone(), Moments::default())).collect(),
            )),
            Transform::Categorify { .. } => Some(PartialStats::Counts(
                columns.iter().map(|c| (c.clone(), ValueCounts::default())).collect(),
            )),
            _ => None,
        }
    }

    /// # Panics
    /// Panics when merging statistics of different kinds.
    pub fn merge(&mut self, other: PartialStats) {
        match (self, other) {
            (PartialStats::Moments(a), PartialStats::Moments(b)) => {
                for (name, m) in b {
                    a.entry(name).or_default().merge(&m);
                }
            }
            (PartialStats::Counts(a), PartialStats::Counts(b)) => {
                for (name, c) in b {
                    a.entry(name).or_default().merge(c);
                }
            }
            _ => panic!("merging moments with value counts"),
        }
    }

    /// # Panics
    /// Panics if the statistics kind does not belong to `transform`.
    pub fn freeze(&self, transform: &Transform) -> OpStats {
        match (self, transform) {
            (PartialStats::Moments(moments), Transform::Normalize) => OpStats::Normalize(
                moments.iter().map(|(n, m)| (n.clone(), m.freeze())).collect(),
            ),
            (PartialStats::Counts(counts), Transform::Categorify { freq_threshold }) => {
                OpStats::Categorify(
                    counts
                        .iter()
                        .map(|(n, c)| (n.clone(), c.freeze(*freq_threshold)))
                        .collect(),
                )
            }
            (_, transform) => panic!("statistics do not belong to {}", transform.name()),
        }
    }
}

/// Frozen statistics of one stateful op, keyed by column.
#[derive(Debug, Clone, PartialEq)]
pub enum OpStats {
    Normalize(IndexMap<String, ContinuousStats>),
    Categorify(IndexMap<String, CategoryTable>),
}

impl OpStats {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            OpStats::Normalize(m) => m.keys().map(String::as_str).collect(),
            OpStats::Categorify(m) => m.keys().map(String::as_str).collect(),
        }
    }
}

// ============================================================================
// Frozen statistics
// ============================================================================

/// Frozen statistics for a whole pipeline, aligned with the op list.
/// Stateless ops have `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrozenStats {
    ops: Vec<Option<OpStats>>,
}

impl FrozenStats {
    pub fn new(ops: Vec<Option<OpStats>>) -> Self {
        Self { ops }
    }

    pub(crate) fn empty(num_ops: usize) -> Self {
        Self {
            ops: vec![None; num_ops],
        }
    }

    pub fn op(&self, index: usize) -> Option<&OpStats> {
        self.ops.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn set(&mut self, index: usize, stats: OpStats) {
        self.ops[index] = Some(stats);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &OpStats)> {
        self.ops
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    /// The category table that decides each categorical column's final
    /// cardinality: the last categorify op's table wins.
    pub fn category_tables(&self) -> IndexMap<&str, &CategoryTable> {
        let mut out = IndexMap::new();
        for (_, stats) in self.iter() {
            if let OpStats::Categorify(tables) = stats {
                for (name, table) in tables {
                    out.insert(name.as_str(), table);
                }
            }
        }
        out
    }

    /// Normalize statistics per column (last normalize op wins).
    pub fn continuous_stats(&self) -> IndexMap<&str, &ContinuousStats> {
        let mut out = IndexMap::new();
        for (_, stats) in self.iter() {
            if let OpStats::Normalize(moments) = stats {
                for (name, s) in moments {
                    out.insert(name.as_str(), s);
                }
            }
        }
        out
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Per-op partial statistics for one fit stage. The reduce step of the fit pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatAggregator {
    by_op: BTreeMap<usize, PartialStats>,
}

impl StatAggregator {
    pub fn insert(&mut self, op_index: usize, partial: PartialStats) {
        match self.by_op.get_mut(&op_index) {
            Some(existing) => existing.merge(partial),
            None => {
                self.by_op.insert(op_index, partial);
            }
        }
    }

    /// Associative and commutative.
    pub fn merge(mut self, other: StatAggregator) -> StatAggregator {
        for (op_index, partial) in other.by_op {
            self.insert(op_index, partial);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.by_op.is_empty()
    }

    /// Freeze every op of `stage`. Ops that saw no partitions freeze from empty
    /// statistics rather than going missing.
    pub fn freeze(&self, schema: &Schema, ops: &[Op], stage: &[usize]) -> Vec<(usize, OpStats)> {
        stage
            .iter()
            .filter_map(|&i| {
                let op = &ops[i];
                let empty;
                let partial = match self.by_op.get(&i) {
                    Some(p) => p,
                    None => {
                        empty = PartialStats::empty(&op.transform, op.columns(schema))?;
                        &empty
                    }
                };
                Some((i, partial.freeze(&op.transform)))
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(i64, u64)]) -> ValueCounts {
        let mut c = ValueCounts::default();
        for &(v, n) in pairs {
            for _ in 0..n {
                c.observe(Some(v));
            }
        }
        c
    }

    // a=100, b=50, c=10, d=2 with raw codes 10, 20, 30, 40
    fn scenario() -> ValueCounts {
        counts(&[(10, 100), (20, 50), (30, 10), (40, 2)])
    }

    #[test]
    fn test_category_scenario_threshold_between_counts() {
        let table = scenario().freeze(5);
        assert_eq!(table.categories(), &[10, 20, 30]);
        assert_eq!(table.counts(), &[100, 50, 10]);
        assert_eq!(table.index_of(None), 0);
        assert_eq!(table.index_of(Some(10)), 2);
        assert_eq!(table.index_of(Some(20)), 3);
        assert_eq!(table.index_of(Some(30)), 4);
        assert_eq!(table.index_of(Some(40)), 1);
        assert_eq!(table.index_of(Some(99)), 1);
        assert_eq!(table.cardinality(), 5);
        assert_eq!(table.num_other(), 2);
    }

    #[test]
    fn test_category_threshold_folds_every_rare_value() {
        let table = scenario().freeze(15);
        assert_eq!(table.index_of(Some(30)), 1);
        assert_eq!(table.index_of(Some(40)), 1);
        assert_eq!(table.cardinality(), 4);
        assert_eq!(table.num_other(), 12);
    }

    #[test]
    fn test_threshold_zero_and_one_keep_everything() {
        assert_eq!(scenario().freeze(0).cardinality(), 6);
        assert_eq!(scenario().freeze(1).cardinality(), 6);
    }

    #[test]
    fn test_indices_contiguous() {
        let mut c = ValueCounts::default();
        for v in 0..500i64 {
            for _ in 0..(v % 7) {
                c.observe(Some(v * 31 - 1000));
            }
        }
        c.observe(None);
        let table = c.freeze(3);
        let mut seen: Vec<i64> = table.categories().iter().map(|&v| table.index_of(Some(v))).collect();
        seen.push(table.index_of(None));
        seen.push(OTHER_INDEX);
        seen.sort_unstable();
        let expected: Vec<i64> = (0..table.cardinality() as i64).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_ties_break_on_raw_value() {
        let table = counts(&[(9, 3), (-4, 3), (5, 3), (1, 8)]).freeze(0);
        assert_eq!(table.categories(), &[1, -4, 5, 9]);
    }

    #[test]
    fn test_value_counts_merge_order_independent() {
        let parts = [
            counts(&[(1, 5), (2, 1)]),
            counts(&[(2, 7), (3, 2)]),
            counts(&[(1, 1), (4, 9), (3, 1)]),
        ];
        let mut forward = ValueCounts::default();
        for p in parts.iter().cloned() {
            forward.merge(p);
        }
        let mut backward = ValueCounts::default();
        for p in parts.iter().rev().cloned() {
            backward.merge(p);
        }
        let mut nested = parts[1].clone();
        nested.merge(parts[2].clone());
        let mut grouped = parts[0].clone();
        grouped.merge(nested);

        assert_eq!(forward, backward);
        assert_eq!(forward, grouped);
        assert_eq!(forward.freeze(2), grouped.freeze(2));
    }

    #[test]
    fn test_moments_freeze() {
        let mut m = Moments::default();
        for v in [Some(1.0), Some(2.0), Some(3.0), None, Some(f32::NAN), Some(4.0)] {
            m.observe(v);
        }
        let s = m.freeze();
        assert_eq!(s.count, 4);
        assert_eq!(s.num_nulls, 2);
        assert!((s.mean - 2.5).abs() < 1e-12);
        assert!((s.std - 1.25f64.sqrt()).abs() < 1e-12);

        let empty = Moments::default().freeze();
        assert_eq!((empty.mean, empty.std), (0.0, 0.0));
    }

    #[test]
    fn test_moments_constant_column_has_zero_std() {
        let mut m = Moments::default();
        for _ in 0..1000 {
            m.observe(Some(0.1));
        }
        let s = m.freeze();
        assert!(s.std >= 0.0);
        assert!(s.std < 1e-3);
    }

    #[test]
    fn test_aggregator_freezes_missing_ops_empty() {
        let schema = crate::common::tests::test_schema();
        let ops = vec![Op::log(), Op::normalize(), Op::categorify(1)];
        let frozen = StatAggregator::default().freeze(&schema, &ops, &[1, 2]);
        assert_eq!(frozen.len(), 2);
        match &frozen[1].1 {
            OpStats::Categorify(t) => assert_eq!(t["C1"].cardinality(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_category_table_json_validates() {
        let table = scenario().freeze(5);
        let json = serde_json::to_string(&table).unwrap();
        let back: CategoryTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
        assert_eq!(back.index_of(Some(20)), 3);

        let dup = r#"{"freq_threshold":0,"num_nulls":0,"num_other":0,"categories":[1,1],"counts":[2,2]}"#;
        assert!(serde_json::from_str::<CategoryTable>(dup).is_err());
    }
}
