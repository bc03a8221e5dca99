//! Lossless export to Avro object container files.

use std::path::Path;

use apache_avro::{
    Reader, Schema, Writer,
    schema::{RecordField, RecordSchema},
    types::Value,
};
use arrow::{
    array::{Array, ArrayRef, AsArray},
    datatypes::{
        DataType, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type, Int64Type, UInt8Type,
        UInt16Type, UInt32Type, UInt64Type,
    },
    record_batch::{RecordBatch, RecordBatchReader},
};
use log::info;
use snafu::prelude::*;

use super::{
    AvroSnafu, ExportError, ExportFormat, ExportReport, ExportResult, ISO_TIMESTAMP_FORMAT,
    InvalidSchemaSnafu, NotARecordSnafu, ReadCombinedSnafu, ReadSchemaSnafu, SinkSnafu,
    next_batch, open_combined,
};
use crate::{
    harmonize::datetime,
    storage::{self, StorageLocation, layout},
};

/// Read and parse an Avro record schema from `path`.
pub async fn load_avro_schema(path: &Path) -> ExportResult<Schema> {
    let display = path.display().to_string();
    let text = tokio::fs::read_to_string(path)
        .await
        .context(ReadSchemaSnafu { path: &display })?;
    let schema = Schema::parse_str(&text).context(InvalidSchemaSnafu { path: &display })?;
    ensure!(
        matches!(schema, Schema::Record(_)),
        NotARecordSnafu { path: display }
    );
    Ok(schema)
}

fn record_of(schema: &Schema) -> Option<&RecordSchema> {
    match schema {
        Schema::Record(record) => Some(record),
        _ => None,
    }
}

fn accepts_null(field: &RecordField) -> bool {
    match &field.schema {
        Schema::Null => true,
        Schema::Union(union) => union.variants().iter().any(|s| matches!(s, Schema::Null)),
        _ => false,
    }
}

/// Where each schema field gets its values from.
#[derive(Debug)]
enum Source {
    Column(usize),
    Null,
}

/// Map dataset columns onto schema fields, rejecting columns the schema
/// does not declare and required fields the dataset does not have.
fn plan_fields(record: &RecordSchema, columns: &[String]) -> ExportResult<Vec<Source>> {
    if let Some(extra) = columns
        .iter()
        .find(|c| !record.fields.iter().any(|f| &f.name == *c))
    {
        return Err(ExportError::SchemaMismatch {
            detail: format!("column {extra} is not declared in the Avro schema"),
        });
    }

    record
        .fields
        .iter()
        .map(|field| match columns.iter().position(|c| c == &field.name) {
            Some(idx) => Ok(Source::Column(idx)),
            None if accepts_null(field) => Ok(Source::Null),
            None => Err(ExportError::SchemaMismatch {
                detail: format!(
                    "required Avro field {} is missing from the dataset",
                    field.name
                ),
            }),
        })
        .collect()
}

fn unsupported(column: &str, data_type: &DataType) -> ExportError {
    ExportError::SchemaMismatch {
        detail: format!("column {column} has Arrow type {data_type}, which has no Avro mapping"),
    }
}

/// Natural Avro value of every row of `array`, before resolution against
/// the target field. Temporal values become ISO-8601 strings here.
fn column_values(column: &str, array: &ArrayRef) -> ExportResult<Vec<Value>> {
    macro_rules! primitive {
        ($ty:ty, $variant:ident, $conv:expr) => {
            array
                .as_primitive::<$ty>()
                .iter()
                .map(|v| v.map_or(Value::Null, |v| Value::$variant($conv(v))))
                .collect()
        };
    }

    let values = match array.data_type() {
        DataType::Null => vec![Value::Null; array.len()],
        DataType::Boolean => array
            .as_boolean()
            .iter()
            .map(|v| v.map_or(Value::Null, Value::Boolean))
            .collect(),
        DataType::Int8 => primitive!(Int8Type, Int, i32::from),
        DataType::Int16 => primitive!(Int16Type, Int, i32::from),
        DataType::Int32 => primitive!(Int32Type, Int, |v: i32| v),
        DataType::UInt8 => primitive!(UInt8Type, Int, i32::from),
        DataType::UInt16 => primitive!(UInt16Type, Int, i32::from),
        DataType::UInt32 => primitive!(UInt32Type, Long, i64::from),
        DataType::Int64 => primitive!(Int64Type, Long, |v: i64| v),
        DataType::UInt64 => {
            let mut out = Vec::with_capacity(array.len());
            for v in array.as_primitive::<UInt64Type>().iter() {
                out.push(match v {
                    None => Value::Null,
                    Some(v) => Value::Long(i64::try_from(v).map_err(|_| {
                        ExportError::SchemaMismatch {
                            detail: format!("column {column} value {v} does not fit an Avro long"),
                        }
                    })?),
                });
            }
            out
        }
        DataType::Float32 => primitive!(Float32Type, Float, |v: f32| v),
        DataType::Float64 => primitive!(Float64Type, Double, |v: f64| v),
        DataType::Utf8 => array
            .as_string::<i32>()
            .iter()
            .map(|v| v.map_or(Value::Null, |s| Value::String(s.to_string())))
            .collect(),
        DataType::LargeUtf8 => array
            .as_string::<i64>()
            .iter()
            .map(|v| v.map_or(Value::Null, |s| Value::String(s.to_string())))
            .collect(),
        DataType::Binary => array
            .as_binary::<i32>()
            .iter()
            .map(|v| v.map_or(Value::Null, |b| Value::Bytes(b.to_vec())))
            .collect(),
        DataType::LargeBinary => array
            .as_binary::<i64>()
            .iter()
            .map(|v| v.map_or(Value::Null, |b| Value::Bytes(b.to_vec())))
            .collect(),
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
            datetime::to_naive(array)
                .into_iter()
                .map(|v| {
                    v.map_or(Value::Null, |dt| {
                        Value::String(dt.format(ISO_TIMESTAMP_FORMAT).to_string())
                    })
                })
                .collect()
        }
        other => return Err(unsupported(column, other)),
    };
    Ok(values)
}

fn batch_records(
    batch: &RecordBatch,
    record: &RecordSchema,
    plan: &[Source],
) -> ExportResult<Vec<Value>> {
    let schema = batch.schema();
    let mut columns = Vec::with_capacity(batch.num_columns());
    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        columns.push(column_values(field.name(), array)?.into_iter());
    }

    let mut records = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut fields = Vec::with_capacity(record.fields.len());
        for (field, source) in record.fields.iter().zip(plan) {
            let value = match source {
                Source::Column(idx) => columns[*idx].next().unwrap_or(Value::Null),
                Source::Null => Value::Null,
            };
            let resolved = value.resolve(&field.schema).map_err(|e| ExportError::SchemaMismatch {
                detail: format!("row {row}, field {}: {e}", field.name),
            })?;
            fields.push((field.name.clone(), resolved));
        }
        records.push(Value::Record(fields));
    }
    Ok(records)
}

/// Write the combined dataset as `combined/all_trip_data.avro`.
///
/// Validation happens before any row is written: a dataset column missing
/// from the schema, or a non-nullable schema field missing from the
/// dataset, is a [`ExportError::SchemaMismatch`]. A value the field type
/// cannot hold is reported the same way when its row is encoded.
pub async fn export_avro(location: &StorageLocation, schema: &Schema) -> ExportResult<ExportReport> {
    let record = record_of(schema).ok_or_else(|| ExportError::SchemaMismatch {
        detail: "lossless export needs a record schema".to_string(),
    })?;

    let mut reader = open_combined(location).await?;
    let columns: Vec<String> = reader
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let plan = plan_fields(record, &columns)?;

    let output = layout::avro_export_rel_path();
    let sink = storage::open_output_sink(location, &output)
        .await
        .context(SinkSnafu)?;
    let mut writer = Writer::new(schema, sink);

    let mut rows = 0u64;
    while let Some(batch) = next_batch(&mut reader)? {
        for value in batch_records(&batch, record, &plan)? {
            writer.append(value).context(AvroSnafu)?;
            rows += 1;
        }
    }

    let sink = writer.into_inner().context(AvroSnafu)?;
    sink.finish().await.context(SinkSnafu)?;

    info!("exported {rows} rows to {}", output.display());
    Ok(ExportReport {
        format: ExportFormat::Avro,
        rows,
        output,
    })
}

/// Read every record of the Avro export back.
pub async fn read_avro_export(location: &StorageLocation) -> ExportResult<Vec<Value>> {
    let bytes = storage::read_all_bytes(location, &layout::avro_export_rel_path())
        .await
        .context(ReadCombinedSnafu)?;
    let reader = Reader::new(bytes.as_slice()).context(AvroSnafu)?;
    reader.collect::<Result<Vec<_>, _>>().context(AvroSnafu)
}
