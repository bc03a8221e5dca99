//! Exporters for the combined dataset.
//!
//! Two independent sinks, both reading the combined artifact back from the
//! store:
//!
//! - [`export_avro`]: lossless, against an externally supplied Avro record
//!   schema. Timestamp columns are rendered as ISO-8601 strings first; the
//!   schema declares them as `["null", "string"]`.
//! - [`export_csv`]: lossy delimited text with a header row.
//!
//! Both write through the temp-then-rename sink, so a failed export never
//! replaces a previous one with a partial file.

mod avro;
mod csv;

use std::{fmt, path::PathBuf};

use arrow::{error::ArrowError, record_batch::RecordBatch};
use bytes::Bytes;
use parquet::{
    arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder},
    errors::ParquetError,
};
use snafu::prelude::*;

pub use avro::{export_avro, load_avro_schema, read_avro_export};
pub use csv::export_csv;

use crate::storage::{self, StorageError, StorageLocation, layout};

/// `strftime` pattern for timestamps in both export formats.
pub const ISO_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Errors raised by the exporters.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExportError {
    /// The dataset does not fit the lossless schema.
    #[snafu(display("Schema mismatch: {detail}"))]
    SchemaMismatch {
        /// What did not fit.
        detail: String,
    },

    /// The schema file could not be read.
    #[snafu(display("Failed to read Avro schema {path}: {source}"))]
    ReadSchema {
        /// Schema file path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The schema file is not a valid Avro schema.
    #[snafu(display("Invalid Avro schema {path}: {source}"))]
    InvalidSchema {
        /// Schema file path.
        path: String,
        /// Underlying Avro error.
        source: apache_avro::Error,
    },

    /// The schema is valid Avro but not a record schema.
    #[snafu(display("Avro schema {path} must be a record schema"))]
    NotARecord {
        /// Schema file path.
        path: String,
    },

    /// The combined dataset could not be read.
    #[snafu(display("Failed to read combined dataset: {source}"))]
    ReadCombined {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The combined dataset is not readable Parquet.
    #[snafu(display("Failed to decode combined dataset: {source}"))]
    DecodeCombined {
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Arrow failed while reading or rendering a batch.
    #[snafu(display("Arrow error during export: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// A column type has no delimited-text rendering.
    #[snafu(display("Column {column} has type {data_type}, which CSV export does not support"))]
    CsvUnsupportedType {
        /// Column name.
        column: String,
        /// Arrow type, for the message.
        data_type: String,
    },

    /// Avro encoding or decoding failed.
    #[snafu(display("Avro error: {source}"))]
    Avro {
        /// Underlying Avro error.
        source: apache_avro::Error,
    },

    /// Opening or committing an export file failed.
    #[snafu(display("Failed to store export: {source}"))]
    Sink {
        /// Underlying storage error.
        source: StorageError,
    },
}

/// Result alias for the exporters.
pub type ExportResult<T> = Result<T, ExportError>;

/// Which export was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Avro object container file.
    Avro,
    /// Comma-separated text.
    Csv,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Avro => f.write_str("avro"),
            ExportFormat::Csv => f.write_str("csv"),
        }
    }
}

/// Structured result of one export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    /// Format written.
    pub format: ExportFormat,
    /// Rows written.
    pub rows: u64,
    /// Relative path of the export artifact.
    pub output: PathBuf,
}

/// Open the combined artifact for batch-wise reading.
pub(crate) async fn open_combined(
    location: &StorageLocation,
) -> ExportResult<ParquetRecordBatchReader> {
    let bytes = storage::read_all_bytes(location, &layout::combined_rel_path())
        .await
        .context(ReadCombinedSnafu)?;
    ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .and_then(|b| b.build())
        .context(DecodeCombinedSnafu)
}

pub(crate) fn next_batch(
    reader: &mut ParquetRecordBatchReader,
) -> ExportResult<Option<RecordBatch>> {
    reader.next().transpose().context(ArrowSnafu)
}
