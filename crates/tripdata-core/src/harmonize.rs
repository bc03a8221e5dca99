//! Schema harmonizer.
//!
//! Turns one raw artifact into one normalized artifact with the canonical
//! record shape:
//!
//! 1. Detect the provider layout from the file schema ([`detect_variant`]).
//!    A file with neither provider's pickup column is rejected as a whole:
//!    a zero-row artifact with the canonical-only schema is emitted and the
//!    rejection is reported.
//! 2. Rename the provider's pickup/dropoff columns to `pickup_datetime` /
//!    `dropoff_datetime` and convert both to the canonical timestamp type.
//! 3. Drop rows whose pickup time is missing or unparseable (they have no
//!    defined hour or weekday). Unparseable dropoff values become null.
//! 4. Derive `pickup_hour` and `pickup_dayofweek` (see [`datetime`] for the
//!    calendar convention) and tag rows with `source_variant`.
//!
//! Canonical column order is pickup, dropoff, provider passthrough columns in
//! source order, then the three derived columns.
//!
//! Harmonizing one artifact touches no shared state, and output bytes are a
//! pure function of input bytes, so artifacts are processed in parallel on a
//! rayon pool and re-running over the same raw file is byte-identical.

pub mod datetime;

use std::sync::Arc;

use arrow::{
    array::{ArrayRef, BooleanArray, Int32Array, StringArray, TimestampMicrosecondArray},
    compute::filter,
    datatypes::{DataType, Field, Schema, SchemaRef},
    error::ArrowError,
    record_batch::RecordBatch,
};
use bytes::Bytes;
use log::{debug, info, warn};
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::Compression,
    errors::ParquetError,
    file::properties::WriterProperties,
};
use rayon::prelude::*;
use snafu::prelude::*;

use crate::{
    storage::{
        self, StorageError, StorageLocation,
        layout::{ArtifactKey, ArtifactKind},
    },
    variant::{DetectedLayout, SourceVariant, detect_variant},
};

use self::datetime::canonical_timestamp_type;

/// Canonical pickup timestamp column.
pub const PICKUP_COLUMN: &str = "pickup_datetime";
/// Canonical dropoff timestamp column.
pub const DROPOFF_COLUMN: &str = "dropoff_datetime";
/// Derived hour-of-day column.
pub const PICKUP_HOUR_COLUMN: &str = "pickup_hour";
/// Derived day-of-week column.
pub const PICKUP_DAYOFWEEK_COLUMN: &str = "pickup_dayofweek";
/// Provider tag column.
pub const SOURCE_VARIANT_COLUMN: &str = "source_variant";

const CANONICAL_NAMES: [&str; 5] = [
    PICKUP_COLUMN,
    DROPOFF_COLUMN,
    PICKUP_HOUR_COLUMN,
    PICKUP_DAYOFWEEK_COLUMN,
    SOURCE_VARIANT_COLUMN,
];

/// Errors that abort harmonization of one artifact.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HarmonizeError {
    /// The raw artifact is not readable Parquet.
    #[snafu(display("Failed to read raw artifact {}: {source}", key.file_name()))]
    ReadParquet {
        /// Artifact being read.
        key: ArtifactKey,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Arrow failed while decoding or reshaping a batch.
    #[snafu(display("Arrow error while harmonizing {}: {source}", key.file_name()))]
    Arrow {
        /// Artifact being processed.
        key: ArtifactKey,
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Encoding the normalized artifact failed.
    #[snafu(display("Failed to write normalized artifact {}: {source}", key.file_name()))]
    WriteParquet {
        /// Artifact being written.
        key: ArtifactKey,
        /// Underlying Parquet error.
        source: ParquetError,
    },
}

/// Hard failures of the harmonize stage.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HarmonizeStageError {
    /// Reading a raw artifact from the store failed.
    #[snafu(display("Failed to load raw artifact {}: {source}", key.file_name()))]
    LoadRaw {
        /// Artifact being read.
        key: ArtifactKey,
        /// Underlying storage error.
        source: StorageError,
    },

    /// Writing a normalized artifact to the store failed.
    #[snafu(display("Failed to store normalized artifact {}: {source}", key.file_name()))]
    StoreNormalized {
        /// Artifact being written.
        key: ArtifactKey,
        /// Underlying storage error.
        source: StorageError,
    },

    /// One artifact could not be harmonized.
    #[snafu(display("{source}"))]
    Artifact {
        /// Underlying per-artifact error.
        source: HarmonizeError,
    },

    /// The worker pool could not be built or a worker panicked.
    #[snafu(display("Harmonize worker pool failure: {message}"))]
    WorkerPool {
        /// Cause.
        message: String,
    },
}

/// Result of harmonizing one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarmonizeOutcome {
    /// Rows were normalized; `rows_out <= rows_in`.
    Normalized {
        /// Rows in the raw artifact.
        rows_in: u64,
        /// Rows in the normalized artifact.
        rows_out: u64,
    },
    /// The layout was not recognised; the artifact has zero rows.
    Rejected {
        /// Rows in the raw artifact.
        rows_in: u64,
    },
}

impl HarmonizeOutcome {
    /// Rows read from the raw artifact.
    pub fn rows_in(&self) -> u64 {
        match *self {
            HarmonizeOutcome::Normalized { rows_in, .. } | HarmonizeOutcome::Rejected { rows_in } => {
                rows_in
            }
        }
    }

    /// Rows written to the normalized artifact.
    pub fn rows_out(&self) -> u64 {
        match *self {
            HarmonizeOutcome::Normalized { rows_out, .. } => rows_out,
            HarmonizeOutcome::Rejected { .. } => 0,
        }
    }

    /// Rows dropped for an unparseable pickup time.
    pub fn rows_dropped(&self) -> u64 {
        match *self {
            HarmonizeOutcome::Normalized { rows_in, rows_out } => rows_in - rows_out,
            HarmonizeOutcome::Rejected { .. } => 0,
        }
    }
}

/// One encoded normalized artifact.
#[derive(Debug, Clone)]
pub struct HarmonizedArtifact {
    /// Key shared with the raw artifact.
    pub key: ArtifactKey,
    /// Encoded Parquet bytes.
    pub bytes: Vec<u8>,
    /// Row accounting.
    pub outcome: HarmonizeOutcome,
}

/// Per-artifact line of a [`HarmonizeReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarmonizeEntry {
    /// Which artifact.
    pub key: ArtifactKey,
    /// What happened to it.
    pub outcome: HarmonizeOutcome,
}

/// Structured result of the harmonize stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarmonizeReport {
    /// One entry per input artifact, in key order.
    pub entries: Vec<HarmonizeEntry>,
}

impl HarmonizeReport {
    /// Artifacts normalized with a recognised layout.
    pub fn normalized_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, HarmonizeOutcome::Normalized { .. }))
            .count()
    }

    /// Artifacts rejected for a structural mismatch.
    pub fn rejected_count(&self) -> usize {
        self.entries.len() - self.normalized_count()
    }

    /// Total rows read.
    pub fn rows_in(&self) -> u64 {
        self.entries.iter().map(|e| e.outcome.rows_in()).sum()
    }

    /// Total rows written.
    pub fn rows_out(&self) -> u64 {
        self.entries.iter().map(|e| e.outcome.rows_out()).sum()
    }

    /// Total rows dropped for an unparseable pickup time.
    pub fn rows_dropped(&self) -> u64 {
        self.entries.iter().map(|e| e.outcome.rows_dropped()).sum()
    }
}

fn canonical_only_schema() -> Schema {
    Schema::new(vec![
        Field::new(PICKUP_COLUMN, canonical_timestamp_type(), false),
        Field::new(DROPOFF_COLUMN, canonical_timestamp_type(), true),
        Field::new(PICKUP_HOUR_COLUMN, DataType::Int32, false),
        Field::new(PICKUP_DAYOFWEEK_COLUMN, DataType::Int32, false),
        Field::new(SOURCE_VARIANT_COLUMN, DataType::Utf8, false),
    ])
}

/// Column mapping from a raw schema to the canonical one.
struct Plan {
    pickup_idx: usize,
    dropoff_idx: Option<usize>,
    passthrough: Vec<usize>,
    output: SchemaRef,
}

impl Plan {
    fn build(raw: &Schema, layout: SourceVariant) -> Option<Plan> {
        let (pickup_idx, pickup) = raw.column_with_name(layout.pickup_column())?;
        if !datetime::is_temporal_source(pickup.data_type()) {
            warn!(
                "{} has type {}, which cannot hold timestamps",
                pickup.name(),
                pickup.data_type()
            );
            return None;
        }
        let dropoff_idx = raw
            .column_with_name(layout.dropoff_column())
            .map(|(idx, _)| idx);

        let mut fields = vec![
            Field::new(PICKUP_COLUMN, canonical_timestamp_type(), false),
            Field::new(DROPOFF_COLUMN, canonical_timestamp_type(), true),
        ];

        let mut passthrough = Vec::new();
        for (idx, field) in raw.fields().iter().enumerate() {
            if idx == pickup_idx || Some(idx) == dropoff_idx {
                continue;
            }
            if CANONICAL_NAMES.contains(&field.name().as_str()) {
                debug!("dropping source column {} that shadows a canonical name", field.name());
                continue;
            }
            passthrough.push(idx);
            fields.push(field.as_ref().clone().with_metadata(Default::default()));
        }

        fields.push(Field::new(PICKUP_HOUR_COLUMN, DataType::Int32, false));
        fields.push(Field::new(PICKUP_DAYOFWEEK_COLUMN, DataType::Int32, false));
        fields.push(Field::new(SOURCE_VARIANT_COLUMN, DataType::Utf8, false));

        Some(Plan {
            pickup_idx,
            dropoff_idx,
            passthrough,
            output: Arc::new(Schema::new(fields)),
        })
    }

    fn apply(&self, batch: &RecordBatch, tag: SourceVariant) -> Result<RecordBatch, ArrowError> {
        let pickup = datetime::to_naive(batch.column(self.pickup_idx));
        let mask = BooleanArray::from(pickup.iter().map(Option::is_some).collect::<Vec<_>>());
        let kept: Vec<_> = pickup.into_iter().flatten().collect();
        let rows = kept.len();

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.output.fields().len());

        columns.push(Arc::new(TimestampMicrosecondArray::from(
            kept.iter().map(datetime::to_micros).collect::<Vec<_>>(),
        )));

        let dropoff: ArrayRef = match self.dropoff_idx {
            Some(idx) => {
                let values = datetime::to_naive(batch.column(idx));
                Arc::new(TimestampMicrosecondArray::from(
                    values
                        .iter()
                        .zip(mask.values().iter())
                        .filter(|(_, keep)| *keep)
                        .map(|(v, _)| v.as_ref().map(datetime::to_micros))
                        .collect::<Vec<_>>(),
                ))
            }
            None => arrow::array::new_null_array(&canonical_timestamp_type(), rows),
        };
        columns.push(dropoff);

        for &idx in &self.passthrough {
            columns.push(filter(batch.column(idx).as_ref(), &mask)?);
        }

        columns.push(Arc::new(Int32Array::from(
            kept.iter().map(datetime::pickup_hour).collect::<Vec<_>>(),
        )));
        columns.push(Arc::new(Int32Array::from(
            kept.iter().map(datetime::pickup_dayofweek).collect::<Vec<_>>(),
        )));
        columns.push(Arc::new(StringArray::from(vec![tag.as_str(); rows])));

        RecordBatch::try_new(Arc::clone(&self.output), columns)
    }
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

fn encode(key: ArtifactKey, schema: SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>, HarmonizeError> {
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, Some(writer_properties()))
        .context(WriteParquetSnafu { key })?;
    for batch in batches {
        writer.write(batch).context(WriteParquetSnafu { key })?;
    }
    writer.close().context(WriteParquetSnafu { key })?;
    Ok(buf)
}

/// Harmonize one raw artifact held in memory.
///
/// `key.variant` is the lineage tag written to `source_variant`; the column
/// mapping follows the layout detected from the file itself.
pub fn harmonize_bytes(key: ArtifactKey, raw: Bytes) -> Result<HarmonizedArtifact, HarmonizeError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(raw).context(ReadParquetSnafu { key })?;
    let rows_in = u64::try_from(builder.metadata().file_metadata().num_rows()).unwrap_or(0);
    let raw_schema = Arc::clone(builder.schema());

    let plan = match detect_variant(&raw_schema) {
        DetectedLayout::Known(layout) => {
            if layout != key.variant {
                warn!(
                    "{} has a {layout} column layout; tagging rows as {}",
                    key.file_name(),
                    key.variant
                );
            }
            Plan::build(&raw_schema, layout)
        }
        DetectedLayout::Unknown => None,
    };

    let Some(plan) = plan else {
        warn!(
            "rejecting {}: no recognised pickup datetime column",
            key.file_name()
        );
        let bytes = encode(key, Arc::new(canonical_only_schema()), &[])?;
        return Ok(HarmonizedArtifact {
            key,
            bytes,
            outcome: HarmonizeOutcome::Rejected { rows_in },
        });
    };

    let reader = builder.build().context(ReadParquetSnafu { key })?;
    let mut batches = Vec::new();
    let mut rows_out = 0u64;
    for batch in reader {
        let batch = batch.context(ArrowSnafu { key })?;
        let normalized = plan.apply(&batch, key.variant).context(ArrowSnafu { key })?;
        rows_out += normalized.num_rows() as u64;
        batches.push(normalized);
    }

    let bytes = encode(key, Arc::clone(&plan.output), &batches)?;
    Ok(HarmonizedArtifact {
        key,
        bytes,
        outcome: HarmonizeOutcome::Normalized { rows_in, rows_out },
    })
}

fn log_outcome(entry: &HarmonizeEntry) {
    match entry.outcome {
        HarmonizeOutcome::Normalized { rows_in, rows_out } => info!(
            "normalized {} ({rows_out}/{rows_in} rows kept)",
            entry.key.file_name()
        ),
        HarmonizeOutcome::Rejected { rows_in } => warn!(
            "structural mismatch in {} ({rows_in} rows rejected)",
            entry.key.file_name()
        ),
    }
}

/// Harmonize the raw artifacts named by `keys` and store the normalized
/// artifacts.
///
/// Work proceeds in chunks of `threads` artifacts: each chunk is loaded,
/// harmonized in parallel on a rayon pool off the async runtime, then
/// stored, which bounds how many raw files are held in memory at once.
pub async fn harmonize_all(
    location: &StorageLocation,
    keys: &[ArtifactKey],
    threads: usize,
) -> Result<HarmonizeReport, HarmonizeStageError> {
    let threads = threads.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("harmonize-{i}"))
        .build()
        .map_err(|e| HarmonizeStageError::WorkerPool {
            message: e.to_string(),
        })?;
    let pool = Arc::new(pool);

    let mut keys = keys.to_vec();
    keys.sort();

    let mut report = HarmonizeReport::default();
    for chunk in keys.chunks(threads) {
        let mut inputs = Vec::with_capacity(chunk.len());
        for &key in chunk {
            let raw = storage::read_all_bytes(location, &key.rel_path(ArtifactKind::Raw))
                .await
                .context(LoadRawSnafu { key })?;
            inputs.push((key, Bytes::from(raw)));
        }

        let pool = Arc::clone(&pool);
        let results = tokio::task::spawn_blocking(move || {
            pool.install(|| {
                inputs
                    .into_par_iter()
                    .map(|(key, raw)| harmonize_bytes(key, raw))
                    .collect::<Vec<_>>()
            })
        })
        .await
        .map_err(|e| HarmonizeStageError::WorkerPool {
            message: e.to_string(),
        })?;

        for result in results {
            let artifact = result.context(ArtifactSnafu)?;
            let rel = artifact.key.rel_path(ArtifactKind::Normalized);
            storage::write_atomic(location, &rel, &artifact.bytes)
                .await
                .context(StoreNormalizedSnafu { key: artifact.key })?;

            let entry = HarmonizeEntry {
                key: artifact.key,
                outcome: artifact.outcome,
            };
            log_outcome(&entry);
            report.entries.push(entry);
        }
    }

    Ok(report)
}

/// Every normalized artifact currently in the store, in key order.
pub async fn list_normalized(location: &StorageLocation) -> Result<Vec<ArtifactKey>, StorageError> {
    let files = storage::list_files(location, &ArtifactKind::Normalized.rel_dir()).await?;
    let mut keys: Vec<ArtifactKey> = files
        .iter()
        .filter_map(|p| ArtifactKey::from_path(p))
        .collect();
    keys.sort();
    Ok(keys)
}
