//! Immutable run configuration.

use std::path::PathBuf;

use crate::{
    fetch::{FetchOptions, SourceTemplates},
    storage::StorageLocation,
};

/// Default watermark record location, relative to the data root.
pub const DEFAULT_WATERMARK_FILE: &str = "last_processed.txt";

/// Years before the current one to start from when no watermark exists.
pub const DEFAULT_LOOKBACK_YEARS: u32 = 3;

/// Everything a run needs to know, built once by the caller.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the artifact store.
    pub data_root: PathBuf,
    /// Watermark record; relative paths resolve against `data_root`.
    pub watermark_path: PathBuf,
    /// Avro record schema for lossless export.
    pub avro_schema_path: Option<PathBuf>,
    /// Source URL templates.
    pub templates: SourceTemplates,
    /// Default lookback when no watermark exists.
    pub lookback_years: u32,
    /// Fetch concurrency and timeout.
    pub fetch: FetchOptions,
    /// Harmonizer worker threads.
    pub harmonize_threads: usize,
}

impl PipelineConfig {
    /// Configuration with defaults for everything but the root and templates.
    pub fn new(data_root: impl Into<PathBuf>, templates: SourceTemplates) -> Self {
        Self {
            data_root: data_root.into(),
            watermark_path: PathBuf::from(DEFAULT_WATERMARK_FILE),
            avro_schema_path: None,
            templates,
            lookback_years: DEFAULT_LOOKBACK_YEARS,
            fetch: FetchOptions::default(),
            harmonize_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    /// Store rooted at `data_root`.
    pub fn location(&self) -> StorageLocation {
        StorageLocation::local(&self.data_root)
    }
}

/// Per-invocation switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Also write `all_trip_data.csv`.
    pub export_csv: bool,
    /// Also write `all_trip_data.avro`.
    pub export_avro: bool,
}
