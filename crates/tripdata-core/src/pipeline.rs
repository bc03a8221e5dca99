//! Pipeline orchestrator.
//!
//! One call to [`Pipeline::run`] is one incremental pass:
//!
//! ```text
//! Idle -> RangeComputed -> Fetching -> Harmonizing -> Combining -> Exporting -> Committed
//!              |                                                                  ^
//!              +------------------------ empty range ---------------------------+
//! any stage error -> Failed (watermark untouched)
//! ```
//!
//! The watermark advances to the range end only after every stage has
//! succeeded for the whole range. Raw and normalized artifacts written
//! before a failure stay in place; re-fetching and re-harmonizing a month is
//! idempotent, so the next run simply retries the full range.
//!
//! A retrieval that failed with a transport error does not stop the later
//! stages (the months that did arrive are still harmonized and combined),
//! but it does keep the run from committing.

mod config;
mod error;
mod report;

use std::sync::Arc;

use log::{info, warn};
use snafu::prelude::*;

pub use config::{DEFAULT_LOOKBACK_YEARS, DEFAULT_WATERMARK_FILE, PipelineConfig, RunOptions};
pub use error::{PipelineError, PipelineResult};
pub use report::{RunReport, RunState, Stage};

use self::error::{
    CombineSnafu, CommitWatermarkSnafu, ExportSnafu, FetchSnafu, HarmonizeSnafu,
    IncompleteFetchSnafu, LoadAvroSchemaSnafu, LockSnafu, MissingAvroSchemaSnafu,
    ReadWatermarkSnafu,
};
use crate::{
    combine,
    export::{self, load_avro_schema},
    fetch::{self, Fetcher},
    harmonize,
    lock::RunLock,
    period::{Period, PeriodRange},
    storage::StorageLocation,
    watermark::{WatermarkSource, WatermarkStore},
};

/// Drives one incremental pass over the configured data root.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    fetcher: Arc<dyn Fetcher>,
}

impl Pipeline {
    /// Pipeline over `config`, retrieving through `fetcher`.
    pub fn new(config: PipelineConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config: Arc::new(config),
            fetcher,
        }
    }

    /// The configuration this pipeline runs with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn watermark_store(&self, location: &StorageLocation) -> WatermarkStore {
        WatermarkStore::new(
            location.clone(),
            self.config.watermark_path.clone(),
            self.config.lookback_years,
        )
    }

    /// Run one pass with `now` as the current calendar period.
    ///
    /// Always returns a report; a failed run carries its error and the
    /// stage it stopped at.
    pub async fn run(&self, now: Period, options: RunOptions) -> RunReport {
        let mut report = RunReport::new();
        if let Err(e) = self.drive(now, options, &mut report).await {
            warn!("pipeline failed while {}: {e}", e.stage());
            report.error = Some(e);
            report.enter(RunState::Failed);
        }
        report
    }

    async fn drive(
        &self,
        now: Period,
        options: RunOptions,
        report: &mut RunReport,
    ) -> PipelineResult<()> {
        let location = self.config.location();
        let _lock = RunLock::acquire(&location).await.context(LockSnafu)?;

        let store = self.watermark_store(&location);
        let (watermark, source) = store.read(now).await.context(ReadWatermarkSnafu)?;
        if source == WatermarkSource::Default {
            info!("no watermark recorded; starting after {watermark}");
        }
        let range = PeriodRange::after(watermark, now);
        report.watermark = Some((watermark, source));
        report.range = Some(range);
        report.enter(RunState::RangeComputed);

        if range.is_empty() {
            info!("pipeline is up to date at {watermark}; nothing to fetch");
            report.enter(RunState::Committed);
            return Ok(());
        }
        info!("ingesting {range} ({} months)", range.len());

        let avro_schema = if options.export_avro {
            let path = self
                .config
                .avro_schema_path
                .as_deref()
                .context(MissingAvroSchemaSnafu)?;
            Some(load_avro_schema(path).await.context(LoadAvroSchemaSnafu)?)
        } else {
            None
        };

        report.enter(RunState::Fetching);
        let fetched = fetch::fetch_range(
            Arc::clone(&self.fetcher),
            &location,
            &self.config.templates,
            range,
            self.config.fetch,
        )
        .await
        .context(FetchSnafu)?;
        info!(
            "fetch: {} fetched, {} missing, {} failed",
            fetched.fetched_count(),
            fetched.missing_count(),
            fetched.failed_count()
        );
        let keys = fetched.fetched_keys();
        let failed = fetched.failed_count();
        report.fetch = Some(fetched);

        report.enter(RunState::Harmonizing);
        let harmonized =
            harmonize::harmonize_all(&location, &keys, self.config.harmonize_threads)
                .await
                .context(HarmonizeSnafu)?;
        info!(
            "harmonize: {} normalized, {} rejected, {} rows dropped",
            harmonized.normalized_count(),
            harmonized.rejected_count(),
            harmonized.rows_dropped()
        );
        report.harmonize = Some(harmonized);

        report.enter(RunState::Combining);
        report.combine = Some(combine::combine_all(&location).await.context(CombineSnafu)?);

        report.enter(RunState::Exporting);
        if options.export_csv {
            let csv = export::export_csv(&location).await.context(ExportSnafu)?;
            report.exports.push(csv);
        }
        if let Some(schema) = &avro_schema {
            let avro = export::export_avro(&location, schema)
                .await
                .context(ExportSnafu)?;
            report.exports.push(avro);
        }

        ensure!(failed == 0, IncompleteFetchSnafu { failed });

        store.write(range.end()).await.context(CommitWatermarkSnafu)?;
        info!("watermark advanced to {}", range.end());
        report.committed = Some(range.end());
        report.enter(RunState::Committed);
        Ok(())
    }
}
