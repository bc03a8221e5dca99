use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use arrow::{
    array::{ArrayRef, Float64Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray},
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::RecordBatch,
};
use async_trait::async_trait;
use bytes::Bytes;
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    errors::ParquetError,
};

use crate::{
    fetch::{FetchError, Fetcher},
    harmonize::datetime::{canonical_timestamp_type, parse_text_timestamp, to_micros},
    period::Period,
    storage::{
        self, StorageLocation,
        layout::{ArtifactKey, ArtifactKind},
    },
    variant::SourceVariant,
};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub fn p(year: i32, month: u32) -> Period {
    Period::new(year, month).expect("valid period")
}

/// In-memory [`Fetcher`]: unknown URLs are `NotFound`.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    objects: HashMap<String, Result<Bytes, String>>,
    delay: Option<Duration>,
    requests: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, url: impl Into<String>, body: Vec<u8>) -> Self {
        self.objects.insert(url.into(), Ok(Bytes::from(body)));
        self
    }

    pub fn with_failure(mut self, url: impl Into<String>, message: &str) -> Self {
        self.objects.insert(url.into(), Err(message.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.objects.get(url) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(message)) => Err(FetchError::Transport {
                url: url.to_string(),
                message: message.clone(),
            }),
            None => Err(FetchError::NotFound {
                url: url.to_string(),
            }),
        }
    }
}

/// One source record for the parquet fixtures.
#[derive(Debug, Clone, Copy)]
pub struct RawRow<'a> {
    pub pickup: &'a str,
    pub dropoff: Option<&'a str>,
    pub distance: f64,
}

impl<'a> RawRow<'a> {
    pub fn new(pickup: &'a str, dropoff: Option<&'a str>, distance: f64) -> Self {
        Self {
            pickup,
            dropoff,
            distance,
        }
    }
}

fn encode(schema: SchemaRef, columns: Vec<ArrayRef>) -> Result<Vec<u8>, ParquetError> {
    let batch = RecordBatch::try_new(Arc::clone(&schema), columns)?;
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buf)
}

/// Yellow layout with textual timestamps and an `Int32` vendor id.
pub fn yellow_raw_parquet(rows: &[RawRow<'_>]) -> Result<Vec<u8>, ParquetError> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("VendorID", DataType::Int32, false),
        Field::new("tpep_pickup_datetime", DataType::Utf8, true),
        Field::new("tpep_dropoff_datetime", DataType::Utf8, true),
        Field::new("trip_distance", DataType::Float64, false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int32Array::from(vec![1; rows.len()])),
        Arc::new(StringArray::from(
            rows.iter().map(|r| Some(r.pickup)).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.dropoff).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.distance).collect::<Vec<_>>(),
        )),
    ];
    encode(schema, columns)
}

/// Green layout with native timestamps, an `Int64` vendor id and an extra
/// `trip_type` column.
pub fn green_raw_parquet(rows: &[RawRow<'_>]) -> Result<Vec<u8>, ParquetError> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("VendorID", DataType::Int64, false),
        Field::new("lpep_pickup_datetime", canonical_timestamp_type(), true),
        Field::new("lpep_dropoff_datetime", canonical_timestamp_type(), true),
        Field::new("trip_distance", DataType::Float64, false),
        Field::new("trip_type", DataType::Int32, true),
    ]));

    let ts = |s: Option<&str>| s.and_then(parse_text_timestamp).map(|dt| to_micros(&dt));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(vec![2; rows.len()])),
        Arc::new(TimestampMicrosecondArray::from(
            rows.iter().map(|r| ts(Some(r.pickup))).collect::<Vec<_>>(),
        )),
        Arc::new(TimestampMicrosecondArray::from(
            rows.iter().map(|r| ts(r.dropoff)).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.distance).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(vec![Some(1); rows.len()])),
    ];
    encode(schema, columns)
}

/// One-row file with the given `Utf8` columns.
pub fn parquet_with_columns(columns: &[(&str, &str)]) -> Result<Vec<u8>, ParquetError> {
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|(name, _)| Field::new(*name, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|(_, value)| Arc::new(StringArray::from(vec![*value])) as ArrayRef)
        .collect();
    encode(schema, arrays)
}

/// File built from named arrays, all declared nullable.
pub fn parquet_with_arrays(columns: Vec<(&str, ArrayRef)>) -> Result<Vec<u8>, ParquetError> {
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
            .collect::<Vec<_>>(),
    ));
    encode(schema, columns.into_iter().map(|(_, array)| array).collect())
}

pub fn raw_parquet_for(variant: SourceVariant, rows: &[RawRow<'_>]) -> Result<Vec<u8>, ParquetError> {
    match variant {
        SourceVariant::Yellow => yellow_raw_parquet(rows),
        SourceVariant::Green => green_raw_parquet(rows),
    }
}

/// Store a raw artifact for `key` in the variant's own layout.
pub async fn write_raw_artifact(
    location: &StorageLocation,
    key: ArtifactKey,
    rows: &[RawRow<'_>],
) -> TestResult {
    let bytes = raw_parquet_for(key.variant, rows)?;
    storage::write_atomic(location, &key.rel_path(ArtifactKind::Raw), &bytes).await?;
    Ok(())
}

pub fn read_parquet_batches(bytes: &[u8]) -> Result<(SchemaRef, Vec<RecordBatch>), ParquetError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(bytes))?;
    let schema = Arc::clone(builder.schema());
    let batches = builder.build()?.collect::<Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}
