use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, StringArray};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, FieldRef, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("I/O error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parquet error for {path}: {source}")]
    Parquet {
        path: String,
        #[source]
        source: parquet::errors::ParquetError,
    },
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("table {path} is missing required column '{column}'")]
    MissingColumn { path: String, column: String },
    #[error("column '{column}' in {path} has type {actual}, expected {expected}")]
    ColumnType {
        path: String,
        column: String,
        actual: String,
        expected: String,
    },
    #[error("metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl TableError {
    /// Schema problems are contained to one table; everything else tears the
    /// run down.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            TableError::MissingColumn { .. } | TableError::ColumnType { .. }
        )
    }
}

/// Columnar table access over a folder of parquet files. Tables are read
/// whole: the pipeline owns batching at the shingle/bucket level, not at the
/// row-group level.
#[derive(Debug, Clone, Default)]
pub struct DataAccess;

impl DataAccess {
    pub fn new() -> Self {
        Self
    }

    /// Lists parquet files under `folder`, sorted by name so that every run
    /// walks the corpus in the same order.
    pub fn list_files(&self, folder: &Path) -> Result<Vec<PathBuf>, TableError> {
        let entries = std::fs::read_dir(folder).map_err(|source| TableError::Io {
            path: folder.display().to_string(),
            source,
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| TableError::Io {
                path: folder.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "parquet") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn get_table(&self, path: &Path) -> Result<RecordBatch, TableError> {
        let file = File::open(path).map_err(|source| TableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|source| TableError::Parquet {
                path: path.display().to_string(),
                source,
            })?;
        let schema = builder.schema().clone();
        let reader = builder.build().map_err(|source| TableError::Parquet {
            path: path.display().to_string(),
            source,
        })?;
        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch?);
        }
        if batches.is_empty() {
            return Ok(RecordBatch::new_empty(schema));
        }
        Ok(concat_batches(&schema, batches.iter())?)
    }

    pub fn write_table(&self, path: &Path, batch: &RecordBatch) -> Result<(), TableError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| TableError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let file = File::create(path).map_err(|source| TableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).map_err(|source| {
            TableError::Parquet {
                path: path.display().to_string(),
                source,
            }
        })?;
        writer.write(batch).map_err(|source| TableError::Parquet {
            path: path.display().to_string(),
            source,
        })?;
        writer.close().map_err(|source| TableError::Parquet {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    pub fn write_metadata<T: Serialize>(&self, path: &Path, document: &T) -> Result<(), TableError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| TableError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let json = serde_json::to_vec_pretty(document)?;
        std::fs::write(path, json).map_err(|source| TableError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Looks up the document text column, requiring Utf8.
pub fn string_column<'a>(
    batch: &'a RecordBatch,
    path: &Path,
    name: &str,
) -> Result<&'a StringArray, TableError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| TableError::MissingColumn {
            path: path.display().to_string(),
            column: name.to_string(),
        })?;
    column
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| TableError::ColumnType {
            path: path.display().to_string(),
            column: name.to_string(),
            actual: column.data_type().to_string(),
            expected: DataType::Utf8.to_string(),
        })
}

/// Looks up the integer document id column, requiring Int64.
pub fn int64_column<'a>(
    batch: &'a RecordBatch,
    path: &Path,
    name: &str,
) -> Result<&'a Int64Array, TableError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| TableError::MissingColumn {
            path: path.display().to_string(),
            column: name.to_string(),
        })?;
    column
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| TableError::ColumnType {
            path: path.display().to_string(),
            column: name.to_string(),
            actual: column.data_type().to_string(),
            expected: DataType::Int64.to_string(),
        })
}

/// Appends one column to a batch, preserving every existing column and row.
pub fn add_column(
    batch: &RecordBatch,
    name: &str,
    column: ArrayRef,
) -> Result<RecordBatch, TableError> {
    let mut fields: Vec<FieldRef> = batch.schema().fields().iter().cloned().collect();
    fields.push(Arc::new(Field::new(
        name,
        column.data_type().clone(),
        column.null_count() > 0,
    )));
    let mut columns = batch.columns().to_vec();
    columns.push(column);
    Ok(RecordBatch::try_new(
        Arc::new(Schema::new(fields)),
        columns,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use std::sync::Arc;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("int_document_id", DataType::Int64, false),
            Field::new("contents", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec!["a", "b", "c"])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parquet_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.parquet");
        let access = DataAccess::new();
        let batch = sample_batch();
        access.write_table(&path, &batch).unwrap();
        let read = access.get_table(&path).unwrap();
        assert_eq!(read.num_rows(), 3);
        assert_eq!(read.schema(), batch.schema());
    }

    #[test]
    fn test_list_files_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let access = DataAccess::new();
        access
            .write_table(&dir.path().join("b.parquet"), &sample_batch())
            .unwrap();
        access
            .write_table(&dir.path().join("a.parquet"), &sample_batch())
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let files = access.list_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.parquet", "b.parquet"]);
    }

    #[test]
    fn test_missing_column_is_a_schema_error() {
        let batch = sample_batch();
        let err = string_column(&batch, Path::new("t.parquet"), "no_such_column").unwrap_err();
        assert!(err.is_schema_error());
    }

    #[test]
    fn test_add_column_preserves_existing_data() {
        let batch = sample_batch();
        let clusters: ArrayRef = Arc::new(Int64Array::from(vec![1, 1, 3]));
        let out = add_column(&batch, "cluster", clusters).unwrap();
        assert_eq!(out.num_columns(), 3);
        assert_eq!(out.num_rows(), 3);
        let ids = int64_column(&out, Path::new("t"), "int_document_id").unwrap();
        assert_eq!(ids.value(2), 3);
        let cl = int64_column(&out, Path::new("t"), "cluster").unwrap();
        assert_eq!(cl.value(1), 1);
    }
}
