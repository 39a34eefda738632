//! Partition source: lazily turns an ordered list of Parquet files into
//! bounded-size partitions.
//!
//! Opening a source reads only the file footers. It validates every file against
//! the schema and plans *read tasks*: runs of consecutive row groups from one
//! file whose rows fit the partition budget. A task is read independently of
//! every other task, so a pass can either walk them in order or spread them over
//! a worker pool. Row groups larger than the budget become a task of their own
//! and are cut into budget-sized partitions while reading.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::{can_cast_types, cast};
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ProjectionMask;
use tracing::{debug, info};

use crate::common::{MemoryBudget, Partition, Schema};
use crate::error::{ConfigError, Error, Result};

// ============================================================================
// Planning
// ============================================================================

/// One unit of parallel work: consecutive row groups from a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTask {
    /// Position in the global task order.
    pub index: usize,
    /// Index into [`PartitionSource::files`].
    pub file: usize,
    pub row_groups: Vec<usize>,
    pub num_rows: usize,
}

#[derive(Debug, Clone)]
struct InputFile {
    path: PathBuf,
    /// Root column indices of the schema columns in this file.
    projection: Vec<usize>,
}

/// Group consecutive row groups while their combined rows fit `budget`.
fn plan_file(file: usize, row_group_rows: &[usize], budget: usize, first_index: usize) -> Vec<ReadTask> {
    let mut tasks = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_rows = 0usize;

    for (rg, &rows) in row_group_rows.iter().enumerate() {
        if rows == 0 {
            continue;
        }
        if !current.is_empty() && current_rows + rows > budget {
            tasks.push(ReadTask {
                index: first_index + tasks.len(),
                file,
                row_groups: std::mem::take(&mut current),
                num_rows: current_rows,
            });
            current_rows = 0;
        }
        current.push(rg);
        current_rows += rows;
    }
    if !current.is_empty() {
        tasks.push(ReadTask {
            index: first_index + tasks.len(),
            file,
            row_groups: current,
            num_rows: current_rows,
        });
    }
    tasks
}

// ============================================================================
// Source
// ============================================================================

/// A restartable, lazily-read collection of partitions over a fixed file list.
#[derive(Debug, Clone)]
pub struct PartitionSource {
    files: Vec<InputFile>,
    schema: Schema,
    arrow_schema: SchemaRef,
    rows_per_partition: usize,
    tasks: Vec<ReadTask>,
    num_rows: usize,
}

impl PartitionSource {
    /// Validate every file against `schema` and plan the read tasks.
    ///
    /// Fails before any data is read if a file is missing or unreadable, lacks
    /// a schema column, or stores a column that cannot be cast to its role's type.
    pub fn open(paths: &[PathBuf], schema: &Schema, budget: MemoryBudget) -> Result<Self> {
        schema.validate()?;
        let arrow_schema = schema.arrow_schema();
        let rows_per_partition = budget.rows_for(schema);

        let mut files = Vec::with_capacity(paths.len());
        let mut tasks = Vec::new();
        let mut num_rows = 0usize;

        for (file_idx, path) in paths.iter().enumerate() {
            let file = File::open(path).map_err(|e| Error::io(path, e))?;
            let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
            let file_schema = builder.schema();

            let mut projection = Vec::with_capacity(arrow_schema.fields().len());
            for field in arrow_schema.fields() {
                let idx = file_schema.index_of(field.name()).map_err(|_| ConfigError::MissingColumn {
                    path: path.clone(),
                    column: field.name().clone(),
                })?;
                let found = file_schema.field(idx).data_type();
                if !can_cast_types(found, field.data_type()) {
                    return Err(ConfigError::UncastableColumn {
                        path: path.clone(),
                        column: field.name().clone(),
                        found: found.clone(),
                        expected: field.data_type().clone(),
                    }
                    .into());
                }
                projection.push(idx);
            }

            let row_group_rows: Vec<usize> = builder
                .metadata()
                .row_groups()
                .iter()
                .map(|rg| rg.num_rows().max(0) as usize)
                .collect();
            let planned = plan_file(file_idx, &row_group_rows, rows_per_partition, tasks.len());
            let file_rows: usize = row_group_rows.iter().sum();
            debug!(
                "  {}: {} rows in {} row groups -> {} tasks",
                path.display(),
                file_rows,
                row_group_rows.len(),
                planned.len()
            );
            num_rows += file_rows;
            tasks.extend(planned);
            files.push(InputFile {
                path: path.clone(),
                projection,
            });
        }

        info!(
            "Opened {} files: {} rows, {} read tasks, up to {} rows per partition",
            files.len(),
            num_rows,
            tasks.len(),
            rows_per_partition
        );

        Ok(Self {
            files,
            schema: schema.clone(),
            arrow_schema,
            rows_per_partition,
            tasks,
            num_rows,
        })
    }

    /// Every `*.parquet` file directly inside `dir`, in file-name order.
    pub fn from_dir(dir: impl AsRef<Path>, schema: &Schema, budget: MemoryBudget) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
            let path = entry.map_err(|e| Error::io(dir, e))?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "parquet") {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(ConfigError::NoInputFiles(dir.to_path_buf()).into());
        }
        paths.sort();
        Self::open(&paths, schema, budget)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }

    pub fn tasks(&self) -> &[ReadTask] {
        &self.tasks
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn rows_per_partition(&self) -> usize {
        self.rows_per_partition
    }

    /// Start reading one task. Partitions come out in file order.
    pub fn read(&self, task: &ReadTask) -> Result<PartitionReader> {
        let input = &self.files[task.file];
        let file = File::open(&input.path).map_err(|e| Error::io(&input.path, e))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), input.projection.iter().copied());
        let reader = builder
            .with_row_groups(task.row_groups.clone())
            .with_projection(mask)
            .with_batch_size(self.rows_per_partition)
            .build()?;
        Ok(PartitionReader {
            reader,
            arrow_schema: Arc::clone(&self.arrow_schema),
        })
    }

    /// All partitions, task by task. Calling it again restarts from the first file.
    pub fn partitions(&self) -> Partitions<'_> {
        Partitions {
            source: self,
            next_task: 0,
            current: None,
        }
    }
}

// ============================================================================
// Readers
// ============================================================================

/// Partitions of a single read task.
pub struct PartitionReader {
    reader: ParquetRecordBatchReader,
    arrow_schema: SchemaRef,
}

impl PartitionReader {
    /// Reorder projected columns into schema order and cast them to their role's type.
    fn coerce(&self, batch: RecordBatch) -> Result<Partition> {
        let columns = self
            .arrow_schema
            .fields()
            .iter()
            .map(|field| {
                let column = batch.column_by_name(field.name()).ok_or_else(|| {
                    ArrowError::SchemaError(format!("projected batch lost column '{}'", field.name()))
                })?;
                if column.data_type() == field.data_type() {
                    Ok(Arc::clone(column))
                } else {
                    cast(column, field.data_type())
                }
            })
            .collect::<Result<Vec<ArrayRef>, _>>()?;
        let batch = RecordBatch::try_new(Arc::clone(&self.arrow_schema), columns)?;
        Ok(Partition::from_batch(batch))
    }
}

impl Iterator for PartitionReader {
    type Item = Result<Partition>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let batch = match self.reader.next()? {
                Ok(batch) => batch,
                Err(e) => return Some(Err(e.into())),
            };
            if batch.num_rows() > 0 {
                return Some(self.coerce(batch));
            }
        }
    }
}

/// Sequential walk over every task of a source. Stops after the first error.
pub struct Partitions<'a> {
    source: &'a PartitionSource,
    next_task: usize,
    current: Option<PartitionReader>,
}

impl Iterator for Partitions<'_> {
    type Item = Result<Partition>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                match reader.next() {
                    Some(Ok(p)) => return Some(Ok(p)),
                    Some(Err(e)) => {
                        self.current = None;
                        self.next_task = self.source.tasks.len();
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            let task = self.source.tasks.get(self.next_task)?;
            self.next_task += 1;
            match self.source.read(task) {
                Ok(reader) => self.current = Some(reader),
                Err(e) => {
                    self.next_task = self.source.tasks.len();
                    return Some(Err(e));
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::tests::test_schema;
    use arrow::array::{Array, Float32Array, Float64Array, Int32Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
    use parquet::arrow::ArrowWriter;
    use parquet::file::properties::WriterProperties;
    use tempfile::TempDir;

    /// Write a parquet file for [`test_schema`] with the given row-group size.
    /// Row `i` holds `I1 = i`, `I2 = 2i` (null every 5th row), `C1 = i % 7`.
    pub(crate) fn write_test_file(path: &Path, start: usize, rows: usize, row_group_rows: usize) {
        let schema = test_schema().arrow_schema();
        let file = File::create(path).unwrap();
        let props = WriterProperties::builder()
            .set_max_row_group_size(row_group_rows)
            .build();
        let mut writer = ArrowWriter::try_new(file, Arc::clone(&schema), Some(props)).unwrap();
        let range = start..start + rows;
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(range.clone().map(|i| Some(i as f32)).collect::<Float32Array>()),
                Arc::new(
                    range
                        .clone()
                        .map(|i| (i % 5 != 0).then_some(2.0 * i as f32))
                        .collect::<Float32Array>(),
                ),
                Arc::new(range.clone().map(|i| Some((i % 7) as i64)).collect::<Int64Array>()),
                Arc::new(range.map(|i| Some((i % 2) as f32)).collect::<Float32Array>()),
            ],
        )
        .unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    fn budget_rows(rows: usize) -> MemoryBudget {
        let width = test_schema().row_width_bytes() as u64;
        MemoryBudget::with_total_bytes(1.0, width * rows as u64).unwrap()
    }

    #[test]
    fn test_plan_merges_and_splits_row_groups() {
        let tasks = plan_file(3, &[10, 10, 10, 50, 5, 0, 5], 25, 7);
        let groups: Vec<_> = tasks.iter().map(|t| t.row_groups.clone()).collect();
        assert_eq!(groups, vec![vec![0, 1], vec![2], vec![3], vec![4, 6]]);
        assert_eq!(tasks.iter().map(|t| t.index).collect::<Vec<_>>(), vec![7, 8, 9, 10]);
        assert!(tasks.iter().all(|t| t.file == 3));
        assert_eq!(tasks[2].num_rows, 50);
    }

    #[test]
    fn test_partitions_cover_all_rows_in_order() {
        let dir = TempDir::new().unwrap();
        write_test_file(&dir.path().join("b.parquet"), 100, 50, 20);
        write_test_file(&dir.path().join("a.parquet"), 0, 100, 30);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = PartitionSource::from_dir(dir.path(), &test_schema(), budget_rows(25)).unwrap();
        assert_eq!(source.num_rows(), 150);
        assert_eq!(source.rows_per_partition(), 25);

        let mut values = Vec::new();
        for partition in source.partitions() {
            let partition = partition.unwrap();
            assert!(partition.num_rows() <= 30);
            values.extend(partition.continuous("I1").values().iter().map(|v| *v as usize));
        }
        assert_eq!(values, (0..150).collect::<Vec<_>>());

        // restartable
        assert_eq!(source.partitions().count(), source.partitions().count());
    }

    #[test]
    fn test_columns_are_coerced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("typed.parquet");
        let schema = Arc::new(ArrowSchema::new(vec![
            Field::new("extra", DataType::Utf8, true),
            Field::new("label", DataType::Int32, false),
            Field::new("C1", DataType::Int32, true),
            Field::new("I2", DataType::Float64, true),
            Field::new("I1", DataType::Int32, true),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(StringArray::from(vec!["x", "y"])),
                Arc::new(Int32Array::from(vec![1, 0])),
                Arc::new(Int32Array::from(vec![Some(4), None])),
                Arc::new(Float64Array::from(vec![0.5, 1.5])),
                Arc::new(Int32Array::from(vec![7, 8])),
            ],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(File::create(&path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let source = PartitionSource::open(&[path], &test_schema(), budget_rows(100)).unwrap();
        let partitions: Vec<_> = source.partitions().collect::<Result<_>>().unwrap();
        assert_eq!(partitions.len(), 1);
        let p = &partitions[0];
        assert_eq!(p.schema(), &test_schema().arrow_schema());
        assert_eq!(p.continuous("I1").values().to_vec(), vec![7.0, 8.0]);
        assert_eq!(p.continuous("I2").values().to_vec(), vec![0.5, 1.5]);
        assert_eq!(p.categorical("C1").value(0), 4);
        assert!(p.categorical("C1").is_null(1));
    }

    #[test]
    fn test_open_fails_fast() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.parquet");
        let err = PartitionSource::open(&[missing], &test_schema(), budget_rows(10)).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));

        let garbage = dir.path().join("garbage.parquet");
        std::fs::write(&garbage, b"not parquet").unwrap();
        let err = PartitionSource::open(&[garbage], &test_schema(), budget_rows(10)).unwrap_err();
        assert!(matches!(err, Error::Parquet(_)));

        let good = dir.path().join("good.parquet");
        write_test_file(&good, 0, 10, 10);
        let wider = Schema::new(["I1", "I2", "I3"], ["C1"], ["label"]).unwrap();
        let err = PartitionSource::open(&[good], &wider, budget_rows(10)).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::MissingColumn { column, .. }) if column == "I3"
        ));

        let empty = TempDir::new().unwrap();
        assert!(matches!(
            PartitionSource::from_dir(empty.path(), &test_schema(), budget_rows(10)),
            Err(Error::Config(ConfigError::NoInputFiles(_)))
        ));
    }
}
