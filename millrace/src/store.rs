//! On-disk store for frozen statistics.
//!
//! Layout:
//!
//! ```text
//! <root>/workflow.json                 format version, schema, ops, creation time
//! <root>/ops/00-normalize/I1.json      ContinuousStats
//! <root>/ops/01-categorify/C1.json     CategoryTable
//! ```
//!
//! One file per (op, column) keeps a single very large category table from
//! forcing every other table through the same JSON document.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::Schema;
use crate::error::{ConfigError, Error, Result, StateError};
use crate::ops::{Op, Transform};
use crate::stats::{FrozenStats, OpStats};

pub const STATS_FORMAT_VERSION: u32 = 1;
pub const WORKFLOW_FILE: &str = "workflow.json";
const OPS_DIR: &str = "ops";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkflowRecord {
    format_version: u32,
    created_at: DateTime<Utc>,
    schema: Schema,
    ops: Vec<Op>,
}

/// A directory holding one fit workflow's frozen statistics.
#[derive(Debug, Clone)]
pub struct StatsStore {
    root: PathBuf,
}

impl StatsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.join(WORKFLOW_FILE).is_file()
    }

    fn op_dir(&self, index: usize, op: &Op) -> PathBuf {
        self.root.join(OPS_DIR).join(format!("{index:02}-{}", op.name()))
    }

    /// Write every table, then `workflow.json` last.
    pub fn save(&self, schema: &Schema, ops: &[Op], frozen: &FrozenStats) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| Error::io(&self.root, e))?;
        let ops_root = self.root.join(OPS_DIR);
        if ops_root.exists() {
            fs::remove_dir_all(&ops_root).map_err(|e| Error::io(&ops_root, e))?;
        }
        let record_path = self.root.join(WORKFLOW_FILE);
        if record_path.exists() {
            fs::remove_file(&record_path).map_err(|e| Error::io(&record_path, e))?;
        }

        let mut num_files = 0;
        for (index, stats) in frozen.iter() {
            let dir = self.op_dir(index, &ops[index]);
            fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
            match stats {
                OpStats::Normalize(columns) => {
                    for (name, s) in columns {
                        write_json(&dir.join(format!("{name}.json")), s)?;
                        num_files += 1;
                    }
                }
                OpStats::Categorify(columns) => {
                    for (name, table) in columns {
                        write_json(&dir.join(format!("{name}.json")), table)?;
                        num_files += 1;
                    }
                }
            }
        }

        let record = WorkflowRecord {
            format_version: STATS_FORMAT_VERSION,
            created_at: Utc::now(),
            schema: schema.clone(),
            ops: ops.to_vec(),
        };
        write_json(&record_path, &record)?;
        info!("Saved {} statistics files to {}", num_files, self.root.display());
        Ok(())
    }

    /// Read back the schema, ops and frozen statistics.
    ///
    /// Every stateful op must have a file for every column it acts on.
    pub fn load(&self) -> Result<(Schema, Vec<Op>, FrozenStats)> {
        let record: WorkflowRecord = read_json(&self.root.join(WORKFLOW_FILE))?;
        if record.format_version != STATS_FORMAT_VERSION {
            return Err(StateError::FormatVersion {
                found: record.format_version,
                expected: STATS_FORMAT_VERSION,
            }
            .into());
        }
        record.schema.validate()?;

        let mut stats = Vec::with_capacity(record.ops.len());
        for (index, op) in record.ops.iter().enumerate() {
            let dir = self.op_dir(index, op);
            let columns = op.columns(&record.schema);
            let path_for = |name: &str| -> Result<PathBuf> {
                let path = dir.join(format!("{name}.json"));
                if !path.is_file() {
                    return Err(StateError::Mismatch(format!(
                        "no statistics for column '{name}' of op {index} ({})",
                        op.name()
                    ))
                    .into());
                }
                Ok(path)
            };
            let op_stats = match op.transform {
                Transform::Normalize => {
                    let mut out = IndexMap::with_capacity(columns.len());
                    for name in columns {
                        out.insert(name.clone(), read_json(&path_for(name)?)?);
                    }
                    Some(OpStats::Normalize(out))
                }
                Transform::Categorify { .. } => {
                    let mut out = IndexMap::with_capacity(columns.len());
                    for name in columns {
                        out.insert(name.clone(), read_json(&path_for(name)?)?);
                    }
                    Some(OpStats::Categorify(out))
                }
                _ => None,
            };
            stats.push(op_stats);
        }

        info!(
            "Loaded statistics for {} ops from {}",
            stats.iter().flatten().count(),
            self.root.display()
        );
        Ok((record.schema, record.ops, FrozenStats::new(stats)))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|e| Error::io(path, e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&text).map_err(|source| {
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
        .into()
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::tests::test_schema;
    use crate::stats::{ContinuousStats, ValueCounts};
    use tempfile::TempDir;

    fn frozen() -> (Vec<Op>, FrozenStats) {
        let ops = vec![Op::fill_missing(0.0), Op::normalize(), Op::categorify(2)];
        let mut moments = IndexMap::new();
        for (name, mean) in [("I1", 1.5), ("I2", -3.0)] {
            moments.insert(
                name.to_string(),
                ContinuousStats {
                    count: 10,
                    num_nulls: 1,
                    mean,
                    std: 0.25,
                },
            );
        }
        let mut counts = ValueCounts::default();
        for v in [5, 5, 5, 9, 9, 1] {
            counts.observe(Some(v));
        }
        counts.observe(None);
        let mut tables = IndexMap::new();
        tables.insert("C1".to_string(), counts.freeze(2));
        let stats = FrozenStats::new(vec![
            None,
            Some(OpStats::Normalize(moments)),
            Some(OpStats::Categorify(tables)),
        ]);
        (ops, stats)
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path().join("stats"));
        let (ops, stats) = frozen();
        assert!(!store.exists());
        store.save(&test_schema(), &ops, &stats).unwrap();
        assert!(store.exists());
        assert!(dir.path().join("stats/ops/02-categorify/C1.json").is_file());
        assert!(dir.path().join("stats/ops/01-normalize/I2.json").is_file());

        let (schema, loaded_ops, loaded) = store.load().unwrap();
        assert_eq!(schema, test_schema());
        assert_eq!(loaded_ops, ops);
        assert_eq!(loaded, stats);
        assert_eq!(loaded.category_tables()["C1"].index_of(Some(5)), 2);
    }

    #[test]
    fn test_continuous_stats_reload_bit_exact() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path());
        let ops = vec![Op::normalize()];
        let mut moments = IndexMap::new();
        for (name, mean, std) in [
            ("I1", 5.811_375_031_255_672, 0.963_913_961_916_329_2),
            ("I2", -1.0 / 3.0, std::f64::consts::PI * 1e-9),
        ] {
            moments.insert(
                name.to_string(),
                ContinuousStats {
                    count: 300,
                    num_nulls: 0,
                    mean,
                    std,
                },
            );
        }
        let stats = FrozenStats::new(vec![Some(OpStats::Normalize(moments))]);
        store.save(&test_schema(), &ops, &stats).unwrap();

        let (_, _, loaded) = store.load().unwrap();
        for (name, saved) in stats.continuous_stats() {
            let restored = loaded.continuous_stats()[name];
            assert_eq!(restored.mean.to_bits(), saved.mean.to_bits(), "{name} mean");
            assert_eq!(restored.std.to_bits(), saved.std.to_bits(), "{name} std");
        }
    }

    #[test]
    fn test_load_detects_missing_table() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path());
        let (ops, stats) = frozen();
        store.save(&test_schema(), &ops, &stats).unwrap();
        fs::remove_file(dir.path().join("ops/01-normalize/I1.json")).unwrap();
        assert!(matches!(
            store.load(),
            Err(Error::State(StateError::Mismatch(msg))) if msg.contains("I1")
        ));
    }

    #[test]
    fn test_load_rejects_other_format_version() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path());
        let (ops, stats) = frozen();
        store.save(&test_schema(), &ops, &stats).unwrap();

        let path = dir.path().join(WORKFLOW_FILE);
        let mut record: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        record["format_version"] = serde_json::json!(99);
        fs::write(&path, record.to_string()).unwrap();

        assert!(matches!(
            store.load(),
            Err(Error::State(StateError::FormatVersion { found: 99, .. }))
        ));
    }

    #[test]
    fn test_resave_replaces_old_tables() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path());
        let (ops, stats) = frozen();
        store.save(&test_schema(), &ops, &stats).unwrap();

        let only_categorify = vec![Op::categorify(2)];
        let tables = stats.op(2).cloned();
        store
            .save(&test_schema(), &only_categorify, &FrozenStats::new(vec![tables]))
            .unwrap();
        assert!(!dir.path().join("ops/01-normalize").exists());
        assert!(dir.path().join("ops/00-categorify/C1.json").is_file());
        assert_eq!(store.load().unwrap().1, only_categorify);
    }
}
