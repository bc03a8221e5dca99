//! Lossy export to comma-separated text.

use arrow::{
    datatypes::{DataType, Schema},
    record_batch::RecordBatchReader,
};
use log::info;
use snafu::prelude::*;

use super::{
    ArrowSnafu, CsvUnsupportedTypeSnafu, ExportFormat, ExportReport, ExportResult,
    ISO_TIMESTAMP_FORMAT, SinkSnafu, next_batch, open_combined,
};
use crate::storage::{self, StorageLocation, layout};

// The Arrow CSV writer has no rendering for nested types.
fn ensure_csv_supported(schema: &Schema) -> ExportResult<()> {
    for field in schema.fields() {
        let dt = field.data_type();
        let unsupported = matches!(
            dt,
            DataType::List(_)
                | DataType::LargeList(_)
                | DataType::FixedSizeList(_, _)
                | DataType::Struct(_)
                | DataType::Map(_, _)
                | DataType::Union(_, _)
        );

        if unsupported {
            return CsvUnsupportedTypeSnafu {
                column: field.name().to_string(),
                data_type: format!("{dt:?}"),
            }
            .fail();
        }
    }

    Ok(())
}

/// Write the combined dataset as `combined/all_trip_data.csv`, with a header
/// row and timestamps in ISO-8601 form.
pub async fn export_csv(location: &StorageLocation) -> ExportResult<ExportReport> {
    let mut reader = open_combined(location).await?;
    ensure_csv_supported(&reader.schema())?;

    let output = layout::csv_export_rel_path();
    let sink = storage::open_output_sink(location, &output)
        .await
        .context(SinkSnafu)?;
    let mut writer = arrow_csv::WriterBuilder::new()
        .with_header(true)
        .with_timestamp_format(ISO_TIMESTAMP_FORMAT.to_string())
        .build(sink);

    let mut rows = 0u64;
    while let Some(batch) = next_batch(&mut reader)? {
        writer.write(&batch).context(ArrowSnafu)?;
        rows += batch.num_rows() as u64;
    }

    let sink = writer.into_inner();
    sink.finish().await.context(SinkSnafu)?;

    info!("exported {rows} rows to {}", output.display());
    Ok(ExportReport {
        format: ExportFormat::Csv,
        rows,
        output,
    })
}
