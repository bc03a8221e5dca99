//! Dataset combiner.
//!
//! Rebuilds the combined dataset from the *whole* normalized corpus on every
//! run. The combined column set is the union of every artifact's columns;
//! rows from an artifact that lacks a column get nulls in it.
//!
//! Types are reconciled with a small widening lattice (see
//! [`unify_types`]); anything outside it is upstream drift and fails the
//! stage with [`CombineError::SchemaConflict`] instead of being coerced.
//!
//! The combine runs in two passes so only one artifact is held in memory at
//! a time: the first pass reads schemas and builds the union, the second
//! streams batches, aligned to the union schema, into the output sink.

use std::{path::PathBuf, sync::Arc};

use arrow::{
    array::{ArrayRef, new_null_array},
    compute::cast,
    datatypes::{DataType, Field, Schema, SchemaRef},
    error::ArrowError,
    record_batch::RecordBatch,
};
use bytes::Bytes;
use log::{debug, info};
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::Compression,
    errors::ParquetError,
    file::properties::WriterProperties,
};
use snafu::prelude::*;

use crate::{
    harmonize,
    storage::{
        self, StorageError, StorageLocation,
        layout::{self, ArtifactKey, ArtifactKind},
    },
};

/// Errors raised by the combine stage.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CombineError {
    /// No normalized artifacts exist.
    #[snafu(display("No normalized artifacts to combine"))]
    EmptyInput,

    /// The same column has incompatible types in two artifacts.
    #[snafu(display(
        "Schema conflict on column {column}: combined so far has {existing}, {artifact} has {incoming}"
    ))]
    SchemaConflict {
        /// Column name.
        column: String,
        /// Type accumulated from earlier artifacts.
        existing: DataType,
        /// Type in the offending artifact.
        incoming: DataType,
        /// File name of the offending artifact.
        artifact: String,
    },

    /// Listing the normalized corpus failed.
    #[snafu(display("Failed to list normalized artifacts: {source}"))]
    ListNormalized {
        /// Underlying storage error.
        source: StorageError,
    },

    /// Reading one normalized artifact failed.
    #[snafu(display("Failed to read normalized artifact {artifact}: {source}"))]
    ReadArtifact {
        /// File name of the artifact.
        artifact: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// A normalized artifact is not readable Parquet.
    #[snafu(display("Failed to decode normalized artifact {artifact}: {source}"))]
    DecodeArtifact {
        /// File name of the artifact.
        artifact: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Arrow failed while aligning a batch to the combined schema.
    #[snafu(display("Arrow error while combining {artifact}: {source}"))]
    Align {
        /// File name of the artifact.
        artifact: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Opening or committing the combined output failed.
    #[snafu(display("Failed to store combined dataset: {source}"))]
    Sink {
        /// Underlying storage error.
        source: StorageError,
    },

    /// Encoding the combined Parquet file failed.
    #[snafu(display("Failed to write combined dataset: {source}"))]
    WriteCombined {
        /// Underlying Parquet error.
        source: ParquetError,
    },
}

/// Result alias for the combine stage.
pub type CombineResult<T> = Result<T, CombineError>;

/// Structured result of the combine stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombineReport {
    /// Number of normalized artifacts read.
    pub artifacts: usize,
    /// Rows written to the combined dataset.
    pub rows: u64,
    /// Combined column names, in order.
    pub columns: Vec<String>,
    /// Relative path of the combined dataset.
    pub output: PathBuf,
}

fn is_integer(dt: &DataType) -> bool {
    dt.is_integer()
}

fn is_float(dt: &DataType) -> bool {
    matches!(dt, DataType::Float16 | DataType::Float32 | DataType::Float64)
}

fn is_text(dt: &DataType) -> bool {
    matches!(dt, DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View)
}

fn is_binary(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Binary | DataType::LargeBinary | DataType::BinaryView
    )
}

fn int_width(dt: &DataType) -> u8 {
    match dt {
        DataType::Int8 | DataType::UInt8 => 8,
        DataType::Int16 | DataType::UInt16 => 16,
        DataType::Int32 | DataType::UInt32 => 32,
        _ => 64,
    }
}

fn widen_integers(a: &DataType, b: &DataType) -> Option<DataType> {
    let (a_signed, b_signed) = (a.is_signed_integer(), b.is_signed_integer());
    if a_signed == b_signed {
        return Some(if int_width(a) >= int_width(b) {
            a.clone()
        } else {
            b.clone()
        });
    }

    let (signed, unsigned) = if a_signed { (a, b) } else { (b, a) };
    if int_width(signed) > int_width(unsigned) {
        Some(signed.clone())
    } else if int_width(unsigned) < 64 {
        Some(DataType::Int64)
    } else {
        None
    }
}

/// Reconcile two declared types of the same column.
///
/// - identical types are compatible;
/// - `Null` unifies with anything;
/// - integers widen to the widest width (mixed signedness widens to a
///   signed type that holds both, `UInt64` with a signed type conflicts);
/// - an integer or float mixed with a float widens to `Float64`;
/// - different encodings of text unify to `LargeUtf8`, and of binary to
///   `LargeBinary`.
///
/// Returns `None` for anything else.
pub fn unify_types(existing: &DataType, incoming: &DataType) -> Option<DataType> {
    if existing == incoming {
        return Some(existing.clone());
    }
    match (existing, incoming) {
        (DataType::Null, other) | (other, DataType::Null) => Some(other.clone()),
        (a, b) if is_integer(a) && is_integer(b) => widen_integers(a, b),
        (a, b) if (is_integer(a) || is_float(a)) && (is_integer(b) || is_float(b)) => {
            Some(DataType::Float64)
        }
        (a, b) if is_text(a) && is_text(b) => Some(DataType::LargeUtf8),
        (a, b) if is_binary(a) && is_binary(b) => Some(DataType::LargeBinary),
        _ => None,
    }
}

/// Accumulates the union schema across artifacts.
#[derive(Debug, Default)]
struct SchemaUnion {
    fields: Vec<Field>,
    seen_in: Vec<usize>,
    artifacts: usize,
}

impl SchemaUnion {
    fn absorb(&mut self, schema: &Schema, artifact: &str) -> CombineResult<()> {
        for incoming in schema.fields() {
            match self
                .fields
                .iter()
                .position(|f| f.name() == incoming.name())
            {
                Some(idx) => {
                    let existing = &self.fields[idx];
                    let unified = unify_types(existing.data_type(), incoming.data_type())
                        .context(SchemaConflictSnafu {
                            column: incoming.name().clone(),
                            existing: existing.data_type().clone(),
                            incoming: incoming.data_type().clone(),
                            artifact,
                        })?;
                    let nullable = existing.is_nullable() || incoming.is_nullable();
                    self.fields[idx] = Field::new(incoming.name(), unified, nullable);
                    self.seen_in[idx] += 1;
                }
                None => {
                    // Columns first seen after the first artifact are absent
                    // from earlier ones, so they must accept nulls.
                    let nullable = incoming.is_nullable() || self.artifacts > 0;
                    self.fields.push(Field::new(
                        incoming.name(),
                        incoming.data_type().clone(),
                        nullable,
                    ));
                    self.seen_in.push(1);
                }
            }
        }
        self.artifacts += 1;
        Ok(())
    }

    fn finish(self) -> Schema {
        let artifacts = self.artifacts;
        Schema::new(
            self.fields
                .into_iter()
                .zip(self.seen_in)
                .map(|(field, seen)| {
                    if seen < artifacts {
                        field.with_nullable(true)
                    } else {
                        field
                    }
                })
                .collect::<Vec<_>>(),
        )
    }
}

/// Project `batch` onto `target`: cast shared columns, null-fill the rest.
fn align_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch, ArrowError> {
    let source = batch.schema();
    let rows = batch.num_rows();
    let columns = target
        .fields()
        .iter()
        .map(|field| match source.index_of(field.name()) {
            Ok(idx) => {
                let column = batch.column(idx);
                if column.data_type() == field.data_type() {
                    Ok(Arc::clone(column))
                } else {
                    cast(column.as_ref(), field.data_type())
                }
            }
            Err(_) => Ok(new_null_array(field.data_type(), rows)),
        })
        .collect::<Result<Vec<ArrayRef>, ArrowError>>()?;
    RecordBatch::try_new(Arc::clone(target), columns)
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

async fn load(location: &StorageLocation, key: &ArtifactKey) -> CombineResult<Bytes> {
    storage::read_all_bytes(location, &key.rel_path(ArtifactKind::Normalized))
        .await
        .map(Bytes::from)
        .context(ReadArtifactSnafu {
            artifact: key.file_name(),
        })
}

/// Union every normalized artifact in the store into the combined dataset.
///
/// The previous combined dataset is replaced only when the new one has been
/// written completely.
pub async fn combine_all(location: &StorageLocation) -> CombineResult<CombineReport> {
    let keys = harmonize::list_normalized(location)
        .await
        .context(ListNormalizedSnafu)?;
    ensure!(!keys.is_empty(), EmptyInputSnafu);

    let mut union = SchemaUnion::default();
    for key in &keys {
        let artifact = key.file_name();
        let bytes = load(location, key).await?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .context(DecodeArtifactSnafu { artifact: &artifact })?;
        union.absorb(builder.schema(), &artifact)?;
    }
    let schema: SchemaRef = Arc::new(union.finish());
    debug!("combined schema: {schema:?}");

    let output = layout::combined_rel_path();
    let sink = storage::open_output_sink(location, &output)
        .await
        .context(SinkSnafu)?;
    let mut writer = ArrowWriter::try_new(sink, Arc::clone(&schema), Some(writer_properties()))
        .context(WriteCombinedSnafu)?;

    let mut rows = 0u64;
    for key in &keys {
        let artifact = key.file_name();
        let bytes = load(location, key).await?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .and_then(|b| b.build())
            .context(DecodeArtifactSnafu { artifact: &artifact })?;

        for batch in reader {
            let batch = batch.context(AlignSnafu { artifact: &artifact })?;
            let aligned = align_batch(&batch, &schema).context(AlignSnafu { artifact: &artifact })?;
            rows += aligned.num_rows() as u64;
            writer.write(&aligned).context(WriteCombinedSnafu)?;
        }
    }

    let sink = writer.into_inner().context(WriteCombinedSnafu)?;
    sink.finish().await.context(SinkSnafu)?;

    let report = CombineReport {
        artifacts: keys.len(),
        rows,
        columns: schema.fields().iter().map(|f| f.name().clone()).collect(),
        output,
    };
    info!(
        "combined {} artifacts into {} ({} rows, {} columns)",
        report.artifacts,
        report.output.display(),
        report.rows,
        report.columns.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        harmonize::{SOURCE_VARIANT_COLUMN, harmonize_all},
        test_util::{RawRow, TestResult, p, read_parquet_batches, write_raw_artifact},
        variant::SourceVariant,
    };
    use arrow::array::{Array, AsArray, Int32Array, LargeStringArray, StringArray};
    use arrow::datatypes::Int64Type;
    use tempfile::TempDir;

    #[test]
    fn unify_follows_the_widening_rules() {
        use DataType::*;
        assert_eq!(unify_types(&Int32, &Int32), Some(Int32));
        assert_eq!(unify_types(&Null, &Utf8), Some(Utf8));
        assert_eq!(unify_types(&Int64, &Null), Some(Int64));
        assert_eq!(unify_types(&Int32, &Int64), Some(Int64));
        assert_eq!(unify_types(&UInt8, &Int16), Some(Int16));
        assert_eq!(unify_types(&UInt32, &Int32), Some(Int64));
        assert_eq!(unify_types(&UInt64, &Int8), None);
        assert_eq!(unify_types(&Int64, &Float32), Some(Float64));
        assert_eq!(unify_types(&Float32, &Float64), Some(Float64));
        assert_eq!(unify_types(&Int64, &Utf8), None);
        assert_eq!(unify_types(&Utf8, &LargeUtf8), Some(LargeUtf8));
        assert_eq!(unify_types(&Utf8View, &Utf8), Some(LargeUtf8));
        assert_eq!(unify_types(&Binary, &LargeBinary), Some(LargeBinary));
        assert_eq!(unify_types(&LargeUtf8, &Binary), None);
        assert_eq!(unify_types(&LargeUtf8, &Int64), None);
    }

    async fn write_normalized(
        location: &StorageLocation,
        key: ArtifactKey,
        schema: Schema,
        columns: Vec<ArrayRef>,
    ) -> TestResult {
        let batch = RecordBatch::try_new(Arc::new(schema), columns)?;
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        storage::write_atomic(location, &key.rel_path(ArtifactKind::Normalized), &buf).await?;
        Ok(())
    }

    #[tokio::test]
    async fn union_fills_missing_columns_with_nulls() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        let yellow = ArtifactKey::new(SourceVariant::Yellow, p(2023, 5));
        let green = ArtifactKey::new(SourceVariant::Green, p(2023, 5));
        write_raw_artifact(
            &location,
            yellow,
            &[
                RawRow::new("2023-05-01 10:00:00", None, 1.0),
                RawRow::new("2023-05-02 11:00:00", None, 2.0),
            ],
        )
        .await?;
        write_raw_artifact(
            &location,
            green,
            &[RawRow::new("2023-05-03 12:00:00", None, 3.0)],
        )
        .await?;
        harmonize_all(&location, &[yellow, green], 2).await?;

        let report = combine_all(&location).await?;
        assert_eq!(report.artifacts, 2);
        assert_eq!(report.rows, 3);
        assert_eq!(report.columns.last().map(String::as_str), Some("trip_type"));

        let bytes = tokio::fs::read(tmp.path().join("combined/all_trip_data.parquet")).await?;
        let (schema, batches) = read_parquet_batches(&bytes)?;

        // Int32 (yellow) and Int64 (green) vendor ids widen to Int64.
        let vendor = schema.field_with_name("VendorID")?;
        assert_eq!(vendor.data_type(), &DataType::Int64);
        assert!(schema.field_with_name("trip_type")?.is_nullable());

        let combined = arrow::compute::concat_batches(&schema, &batches)?;
        let vendors = combined
            .column(schema.index_of("VendorID")?)
            .as_primitive::<Int64Type>();
        assert_eq!(vendors.values().to_vec(), vec![1, 1, 2]);

        let trip_type = combined.column(schema.index_of("trip_type")?);
        assert_eq!(trip_type.null_count(), 2);
        assert!(trip_type.is_valid(2));

        let tags = combined
            .column(schema.index_of(SOURCE_VARIANT_COLUMN)?)
            .as_string::<i32>();
        let tags: Vec<_> = tags.iter().flatten().collect();
        assert_eq!(tags, vec!["yellow", "yellow", "green"]);
        Ok(())
    }

    #[tokio::test]
    async fn incompatible_types_are_a_conflict() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        write_normalized(
            &location,
            ArtifactKey::new(SourceVariant::Yellow, p(2023, 1)),
            Schema::new(vec![Field::new("fare", DataType::Int32, false)]),
            vec![Arc::new(Int32Array::from(vec![10]))],
        )
        .await?;
        write_normalized(
            &location,
            ArtifactKey::new(SourceVariant::Yellow, p(2023, 2)),
            Schema::new(vec![Field::new("fare", DataType::Utf8, false)]),
            vec![Arc::new(StringArray::from(vec!["ten"]))],
        )
        .await?;

        let err = combine_all(&location).await.expect_err("expected conflict");
        match err {
            CombineError::SchemaConflict {
                column, artifact, ..
            } => {
                assert_eq!(column, "fare");
                assert_eq!(artifact, "yellow_tripdata_2023-02.parquet");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!tmp.path().join("combined/all_trip_data.parquet").exists());
        Ok(())
    }

    #[tokio::test]
    async fn mixed_text_encodings_unify_instead_of_conflicting() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        write_normalized(
            &location,
            ArtifactKey::new(SourceVariant::Yellow, p(2023, 5)),
            Schema::new(vec![Field::new("store_and_fwd_flag", DataType::LargeUtf8, true)]),
            vec![Arc::new(LargeStringArray::from(vec![Some("N"), None]))],
        )
        .await?;
        write_normalized(
            &location,
            ArtifactKey::new(SourceVariant::Green, p(2023, 5)),
            Schema::new(vec![Field::new("store_and_fwd_flag", DataType::Utf8, true)]),
            vec![Arc::new(StringArray::from(vec![Some("Y")]))],
        )
        .await?;

        let report = combine_all(&location).await?;
        assert_eq!(report.rows, 3);

        let bytes = tokio::fs::read(tmp.path().join("combined/all_trip_data.parquet")).await?;
        let (schema, batches) = read_parquet_batches(&bytes)?;
        let flag = schema.field_with_name("store_and_fwd_flag")?;
        assert_eq!(flag.data_type(), &DataType::LargeUtf8);

        let combined = arrow::compute::concat_batches(&schema, &batches)?;
        let flags: Vec<Option<&str>> = combined.column(0).as_string::<i64>().iter().collect();
        assert_eq!(flags, vec![Some("N"), None, Some("Y")]);
        Ok(())
    }

    #[tokio::test]
    async fn empty_corpus_is_empty_input() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        tokio::fs::create_dir_all(tmp.path().join("processed")).await?;
        tokio::fs::write(tmp.path().join("processed/README"), b"not an artifact").await?;

        let err = combine_all(&location).await.expect_err("expected EmptyInput");
        assert!(matches!(err, CombineError::EmptyInput));
        Ok(())
    }
}
