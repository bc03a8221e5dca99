//! Error types and SNAFU context selectors for `pipeline`.
//!
//! Every variant maps to the [`Stage`] it aborted, so callers can report
//! *where* a run failed without matching on the variant themselves.

use snafu::prelude::*;

use crate::{
    combine::CombineError, export::ExportError, fetch::FetchStageError,
    harmonize::HarmonizeStageError, lock::LockError, watermark::WatermarkError,
};

use super::report::Stage;

/// Errors that end a run in the failed state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PipelineError {
    /// The single-instance guard could not be taken.
    #[snafu(display("Could not acquire run lock: {source}"))]
    Lock {
        /// Underlying lock error.
        source: LockError,
    },

    /// The persisted watermark could not be read.
    #[snafu(display("Could not read watermark: {source}"))]
    ReadWatermark {
        /// Underlying watermark error.
        source: WatermarkError,
    },

    /// Lossless export was requested without a schema file.
    #[snafu(display("Avro export requested but no Avro schema file is configured"))]
    MissingAvroSchema,

    /// The lossless export schema could not be loaded.
    #[snafu(display("Could not load Avro schema: {source}"))]
    LoadAvroSchema {
        /// Underlying export error.
        source: ExportError,
    },

    /// Storing fetched data failed.
    #[snafu(display("Fetch stage failed: {source}"))]
    Fetch {
        /// Underlying fetch stage error.
        source: FetchStageError,
    },

    /// Some months could not be retrieved; the range stays uncommitted.
    #[snafu(display(
        "{failed} retrieval(s) failed with transport errors; the range will be retried"
    ))]
    IncompleteFetch {
        /// Number of failed retrievals.
        failed: usize,
    },

    /// Harmonization failed.
    #[snafu(display("Harmonize stage failed: {source}"))]
    Harmonize {
        /// Underlying harmonize stage error.
        source: HarmonizeStageError,
    },

    /// Combining failed (including schema conflicts and empty input).
    #[snafu(display("Combine stage failed: {source}"))]
    Combine {
        /// Underlying combine error.
        source: CombineError,
    },

    /// An export failed.
    #[snafu(display("Export stage failed: {source}"))]
    Export {
        /// Underlying export error.
        source: ExportError,
    },

    /// Writing the new watermark failed.
    #[snafu(display("Could not commit watermark: {source}"))]
    CommitWatermark {
        /// Underlying watermark error.
        source: WatermarkError,
    },
}

impl PipelineError {
    /// The stage this error aborted.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Lock { .. } => Stage::Locking,
            PipelineError::ReadWatermark { .. } => Stage::ComputingRange,
            PipelineError::Fetch { .. } | PipelineError::IncompleteFetch { .. } => Stage::Fetching,
            PipelineError::Harmonize { .. } => Stage::Harmonizing,
            PipelineError::Combine { .. } => Stage::Combining,
            PipelineError::MissingAvroSchema
            | PipelineError::LoadAvroSchema { .. }
            | PipelineError::Export { .. } => Stage::Exporting,
            PipelineError::CommitWatermark { .. } => Stage::Committing,
        }
    }
}

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
