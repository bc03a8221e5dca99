//! Persisted ingestion watermark.
//!
//! The watermark is the last calendar month known to be fully ingested. It
//! is stored as a single `YYYY-MM` text record. A missing (or blank) record
//! is a valid initial state: the store then reports a default period
//! `lookback_years` before the present, month 1.
//!
//! The store has no locking of its own; concurrent pipeline runs must be
//! excluded externally (see [`crate::lock::RunLock`]).

use std::path::{Path, PathBuf};

use snafu::prelude::*;

use crate::{
    period::{Period, PeriodError},
    storage::{self, StorageError, StorageLocation},
};

/// Errors from reading or writing the watermark.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WatermarkError {
    /// Reading or writing the record failed.
    #[snafu(display("Watermark I/O error: {source}"))]
    Io {
        /// Underlying storage error.
        source: StorageError,
    },

    /// The record exists but does not hold a valid period.
    #[snafu(display("Watermark record at {path} is corrupt: {source}"))]
    Corrupt {
        /// Where the record lives.
        path: String,
        /// Underlying parse error.
        source: PeriodError,
    },

    /// The default lookback produced an unrepresentable period.
    #[snafu(display("Default lookback of {years} years from {now} is out of range"))]
    LookbackOutOfRange {
        /// Configured lookback.
        years: u32,
        /// The period the lookback was computed from.
        now: Period,
    },
}

/// Result alias for watermark operations.
pub type WatermarkResult<T> = Result<T, WatermarkError>;

/// Where the watermark came from on a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkSource {
    /// Read from the persisted record.
    Persisted,
    /// No record existed; the default lookback was applied.
    Default,
}

/// Reads and writes the persisted watermark record.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    location: StorageLocation,
    rel_path: PathBuf,
    lookback_years: u32,
}

impl WatermarkStore {
    /// Store backed by `rel_path` under `location`.
    pub fn new(location: StorageLocation, rel_path: impl Into<PathBuf>, lookback_years: u32) -> Self {
        Self {
            location,
            rel_path: rel_path.into(),
            lookback_years,
        }
    }

    /// Relative path of the record.
    pub fn rel_path(&self) -> &Path {
        &self.rel_path
    }

    /// Read the watermark, falling back to the default lookback relative to
    /// `now` when no record exists.
    pub async fn read(&self, now: Period) -> WatermarkResult<(Period, WatermarkSource)> {
        match self.read_persisted().await? {
            Some(period) => Ok((period, WatermarkSource::Persisted)),
            None => Ok((self.default_for(now)?, WatermarkSource::Default)),
        }
    }

    /// Read only the persisted record, if any.
    pub async fn read_persisted(&self) -> WatermarkResult<Option<Period>> {
        let text = match storage::read_to_string(&self.location, &self.rel_path).await {
            Ok(text) => text,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => return Err(WatermarkError::Io { source }),
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        trimmed.parse::<Period>().map(Some).context(CorruptSnafu {
            path: self.location.resolve(&self.rel_path).display().to_string(),
        })
    }

    /// Persist `period` atomically.
    pub async fn write(&self, period: Period) -> WatermarkResult<()> {
        storage::write_atomic(
            &self.location,
            &self.rel_path,
            period.to_string().as_bytes(),
        )
        .await
        .context(IoSnafu)
    }

    fn default_for(&self, now: Period) -> WatermarkResult<Period> {
        let year = i32::try_from(self.lookback_years)
            .ok()
            .and_then(|years| now.year().checked_sub(years));
        year.and_then(|y| Period::new(y, 1).ok())
            .context(LookbackOutOfRangeSnafu {
                years: self.lookback_years,
                now,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn p(year: i32, month: u32) -> Period {
        Period::new(year, month).expect("valid period")
    }

    fn store(tmp: &TempDir) -> WatermarkStore {
        WatermarkStore::new(StorageLocation::local(tmp.path()), "last_ingested.txt", 3)
    }

    #[tokio::test]
    async fn missing_record_uses_default_lookback() -> TestResult {
        let tmp = TempDir::new()?;
        let (period, source) = store(&tmp).read(p(2025, 7)).await?;
        assert_eq!(period, p(2022, 1));
        assert_eq!(source, WatermarkSource::Default);
        Ok(())
    }

    #[tokio::test]
    async fn blank_record_counts_as_missing() -> TestResult {
        let tmp = TempDir::new()?;
        tokio::fs::write(tmp.path().join("last_ingested.txt"), "  \n").await?;
        let (_, source) = store(&tmp).read(p(2025, 7)).await?;
        assert_eq!(source, WatermarkSource::Default);
        Ok(())
    }

    #[tokio::test]
    async fn write_then_read_uses_zero_padded_format() -> TestResult {
        let tmp = TempDir::new()?;
        let store = store(&tmp);
        store.write(p(2023, 3)).await?;

        let raw = tokio::fs::read_to_string(tmp.path().join("last_ingested.txt")).await?;
        assert_eq!(raw, "2023-03");

        let (period, source) = store.read(p(2025, 7)).await?;
        assert_eq!(period, p(2023, 3));
        assert_eq!(source, WatermarkSource::Persisted);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() -> TestResult {
        let tmp = TempDir::new()?;
        tokio::fs::write(tmp.path().join("last_ingested.txt"), "march").await?;
        let err = store(&tmp)
            .read(p(2025, 7))
            .await
            .expect_err("expected corrupt watermark");
        assert!(matches!(err, WatermarkError::Corrupt { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn out_of_range_year_is_corrupt_not_a_panic() -> TestResult {
        let tmp = TempDir::new()?;
        tokio::fs::write(tmp.path().join("last_ingested.txt"), "2147483647-12\n").await?;
        let err = store(&tmp)
            .read(p(2025, 7))
            .await
            .expect_err("year beyond YYYY");
        assert!(matches!(err, WatermarkError::Corrupt { .. }));
        Ok(())
    }
}
