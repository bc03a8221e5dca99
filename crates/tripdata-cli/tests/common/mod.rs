use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::array::{ArrayRef, Float64Array, Int32Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use tempfile::TempDir;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub fn data_root(tmp: &TempDir) -> PathBuf {
    tmp.path().join("data")
}

/// Encode a small yellow-layout month with textual timestamps.
///
/// Every third row has no pickup time and is dropped by the harmonizer.
pub fn yellow_month_parquet(year: i32, month: u32, rows: usize) -> TestResult<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("VendorID", DataType::Int32, false),
        Field::new("tpep_pickup_datetime", DataType::Utf8, true),
        Field::new("tpep_dropoff_datetime", DataType::Utf8, true),
        Field::new("trip_distance", DataType::Float64, false),
    ]));

    let mut pickups = Vec::with_capacity(rows);
    let mut dropoffs = Vec::with_capacity(rows);
    let mut distances = Vec::with_capacity(rows);
    for i in 0..rows {
        let day = 1 + (i % 28) as u32;
        let hour = (i % 24) as u32;
        pickups.push(if i % 3 == 2 {
            None
        } else {
            Some(format!("{year:04}-{month:02}-{day:02} {hour:02}:05:00"))
        });
        dropoffs.push(Some(format!("{year:04}-{month:02}-{day:02} {hour:02}:35:00")));
        distances.push(1.0 + i as f64 / 10.0);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int32Array::from(vec![1; rows])),
        Arc::new(StringArray::from(pickups)),
        Arc::new(StringArray::from(dropoffs)),
        Arc::new(Float64Array::from(distances)),
    ];
    let batch = RecordBatch::try_new(Arc::clone(&schema), columns)?;

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buf)
}

pub fn write_watermark(path: &Path, period: &str) -> TestResult {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{period}\n"))?;
    Ok(())
}

pub fn read_watermark(path: &Path) -> TestResult<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}
