//! Range fetcher.
//!
//! Given an inclusive [`PeriodRange`] and one URL template per
//! [`SourceVariant`], retrieve every `(variant, month)` artifact and store it
//! as a raw artifact. Each retrieval is independent:
//!
//! - a missing remote file ([`FetchError::NotFound`]) is an expected,
//!   soft outcome (some months or variants legitimately do not exist yet);
//! - any other failure ([`FetchError::Transport`], including a per-request
//!   timeout) is recorded for that `(variant, month)` and the remaining
//!   months proceed.
//!
//! The returned [`FetchReport`] holds exactly one entry per
//! `(variant, month)` in the range, in calendar order, regardless of what
//! the remote side had. The fetcher never touches the watermark.

mod http;
mod template;

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use log::{debug, info, warn};
use snafu::prelude::*;

pub use http::{HttpClientError, HttpFetcher};
pub use template::{TemplateError, UrlTemplate};

use crate::{
    period::{Period, PeriodRange},
    storage::{
        self, StorageError, StorageLocation,
        layout::{ArtifactKey, ArtifactKind},
    },
    variant::SourceVariant,
};

/// Failure of a single retrieval.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    /// The remote object does not exist.
    #[snafu(display("not found: {url}"))]
    NotFound {
        /// Requested URL.
        url: String,
    },

    /// Anything else: connection failure, server error, timeout.
    #[snafu(display("transport error for {url}: {message}"))]
    Transport {
        /// Requested URL.
        url: String,
        /// Human-readable cause.
        message: String,
    },
}

/// The fetch capability: `fetch(url) -> bytes | NotFound | Transport`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieve the object at `url`.
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// Hard failure of the fetch stage.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FetchStageError {
    /// A fetched artifact could not be written to the store.
    #[snafu(display("Failed to store raw artifact {key:?}: {source}"))]
    StoreRaw {
        /// Artifact being written.
        key: ArtifactKey,
        /// Underlying storage error.
        source: StorageError,
    },
}

/// URL templates for both providers.
#[derive(Debug, Clone)]
pub struct SourceTemplates {
    /// Template for [`SourceVariant::Yellow`].
    pub yellow: UrlTemplate,
    /// Template for [`SourceVariant::Green`].
    pub green: UrlTemplate,
}

impl SourceTemplates {
    /// Template for `variant`.
    pub fn for_variant(&self, variant: SourceVariant) -> &UrlTemplate {
        match variant {
            SourceVariant::Yellow => &self.yellow,
            SourceVariant::Green => &self.green,
        }
    }

    /// Concrete URL for `key`.
    pub fn url_for(&self, key: &ArtifactKey) -> String {
        self.for_variant(key.variant).render(key.period)
    }
}

/// Tuning knobs for the fetch stage.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Maximum number of in-flight requests.
    pub concurrency: usize,
    /// Per-request timeout; expiry is a soft transport failure.
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout: Duration::from_secs(300),
        }
    }
}

/// What happened to one `(variant, month)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    /// Retrieved and stored as a raw artifact.
    Fetched {
        /// Size of the stored artifact.
        bytes: u64,
    },
    /// The remote side has no such file.
    Missing,
    /// Retrieval failed; the month is not ingested.
    Failed {
        /// Cause, for reporting.
        reason: String,
    },
}

/// Per-artifact line of a [`FetchReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchEntry {
    /// Which artifact.
    pub key: ArtifactKey,
    /// URL that was requested.
    pub url: String,
    /// Outcome.
    pub status: FetchStatus,
}

/// Structured result of the fetch stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// One entry per `(variant, month)` in the range, in calendar order.
    pub entries: Vec<FetchEntry>,
}

impl FetchReport {
    /// Keys of the artifacts stored by this run.
    pub fn fetched_keys(&self) -> Vec<ArtifactKey> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, FetchStatus::Fetched { .. }))
            .map(|e| e.key)
            .collect()
    }

    /// Every month the stage accounted for.
    pub fn periods(&self) -> BTreeSet<Period> {
        self.entries.iter().map(|e| e.key.period).collect()
    }

    /// Number of artifacts stored.
    pub fn fetched_count(&self) -> usize {
        self.count(|s| matches!(s, FetchStatus::Fetched { .. }))
    }

    /// Number of artifacts the remote side did not have.
    pub fn missing_count(&self) -> usize {
        self.count(|s| matches!(s, FetchStatus::Missing))
    }

    /// Number of retrievals that failed.
    pub fn failed_count(&self) -> usize {
        self.count(|s| matches!(s, FetchStatus::Failed { .. }))
    }

    /// Failed entries, for reporting.
    pub fn failures(&self) -> impl Iterator<Item = &FetchEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, FetchStatus::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&FetchStatus) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.status)).count()
    }
}

async fn fetch_with_timeout(
    fetcher: &dyn Fetcher,
    url: &str,
    timeout: Duration,
) -> Result<Bytes, FetchError> {
    match tokio::time::timeout(timeout, fetcher.fetch(url)).await {
        Ok(result) => result,
        Err(_) => TransportSnafu {
            url,
            message: format!("timed out after {}s", timeout.as_secs_f64()),
        }
        .fail(),
    }
}

async fn fetch_one(
    fetcher: &dyn Fetcher,
    location: &StorageLocation,
    key: ArtifactKey,
    url: String,
    timeout: Duration,
) -> Result<FetchEntry, FetchStageError> {
    let status = match fetch_with_timeout(fetcher, &url, timeout).await {
        Ok(body) => {
            storage::write_atomic(location, &key.rel_path(ArtifactKind::Raw), &body)
                .await
                .context(StoreRawSnafu { key })?;
            debug!("fetched {url} ({} bytes)", body.len());
            FetchStatus::Fetched {
                bytes: body.len() as u64,
            }
        }
        Err(FetchError::NotFound { .. }) => {
            info!("no {} data for {} at {url}; skipping", key.variant, key.period);
            FetchStatus::Missing
        }
        Err(e @ FetchError::Transport { .. }) => {
            warn!("failed to fetch {} {}: {e}", key.variant, key.period);
            FetchStatus::Failed {
                reason: e.to_string(),
            }
        }
    };

    Ok(FetchEntry { key, url, status })
}

/// Retrieve every `(variant, month)` in `range` and store the raw artifacts.
///
/// Requests run concurrently up to `options.concurrency`. The report is
/// sorted into calendar order (then variant order) before it is returned.
pub async fn fetch_range(
    fetcher: Arc<dyn Fetcher>,
    location: &StorageLocation,
    templates: &SourceTemplates,
    range: PeriodRange,
    options: FetchOptions,
) -> Result<FetchReport, FetchStageError> {
    let jobs: Vec<(ArtifactKey, String)> = range
        .iter()
        .flat_map(|period| {
            SourceVariant::ALL
                .into_iter()
                .map(move |variant| ArtifactKey::new(variant, period))
        })
        .map(|key| (key, templates.url_for(&key)))
        .collect();

    let mut entries: Vec<FetchEntry> = stream::iter(jobs)
        .map(|(key, url)| {
            let fetcher = Arc::clone(&fetcher);
            async move { fetch_one(fetcher.as_ref(), location, key, url, options.timeout).await }
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;

    entries.sort_by_key(|e| e.key);
    Ok(FetchReport { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{MemoryFetcher, p};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn templates() -> SourceTemplates {
        SourceTemplates {
            yellow: UrlTemplate::parse("mem://yellow/{year}-{month:02d}").expect("template"),
            green: UrlTemplate::parse("mem://green/{year}-{month:02d}").expect("template"),
        }
    }

    #[tokio::test]
    async fn report_covers_every_month_in_range() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let fetcher = MemoryFetcher::new()
            .with_body("mem://yellow/2023-11", b"y-nov".to_vec())
            .with_body("mem://green/2024-01", b"g-jan".to_vec());

        let range = PeriodRange::new(p(2023, 11), p(2024, 2));
        let report = fetch_range(
            Arc::new(fetcher),
            &location,
            &templates(),
            range,
            FetchOptions::default(),
        )
        .await?;

        let expected: BTreeSet<Period> = range.iter().collect();
        assert_eq!(report.periods(), expected);
        assert_eq!(report.entries.len(), 8);
        assert_eq!(report.fetched_count(), 2);
        assert_eq!(report.missing_count(), 6);
        assert_eq!(report.failed_count(), 0);

        let keys: Vec<ArtifactKey> = report.entries.iter().map(|e| e.key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        let stored = tokio::fs::read(tmp.path().join("raw/green_tripdata_2024-01.parquet")).await?;
        assert_eq!(stored, b"g-jan");
        Ok(())
    }

    #[tokio::test]
    async fn transport_failure_is_isolated_to_its_month() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let fetcher = MemoryFetcher::new()
            .with_failure("mem://yellow/2023-04", "connection reset")
            .with_body("mem://yellow/2023-05", b"y-may".to_vec());

        let report = fetch_range(
            Arc::new(fetcher),
            &location,
            &templates(),
            PeriodRange::new(p(2023, 4), p(2023, 5)),
            FetchOptions::default(),
        )
        .await?;

        assert_eq!(report.failed_count(), 1);
        assert_eq!(
            report.fetched_keys(),
            vec![ArtifactKey::new(SourceVariant::Yellow, p(2023, 5))]
        );
        Ok(())
    }

    #[tokio::test]
    async fn slow_fetch_times_out_softly() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let fetcher = MemoryFetcher::new()
            .with_body("mem://yellow/2023-04", b"late".to_vec())
            .with_delay(Duration::from_millis(200));

        let report = fetch_range(
            Arc::new(fetcher),
            &location,
            &templates(),
            PeriodRange::new(p(2023, 4), p(2023, 4)),
            FetchOptions {
                concurrency: 2,
                timeout: Duration::from_millis(20),
            },
        )
        .await?;

        let yellow = &report.entries[0];
        assert!(matches!(&yellow.status, FetchStatus::Failed { reason } if reason.contains("timed out")));
        Ok(())
    }

    #[tokio::test]
    async fn empty_range_fetches_nothing() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let fetcher = Arc::new(MemoryFetcher::new());

        let report = fetch_range(
            fetcher.clone(),
            &location,
            &templates(),
            PeriodRange::after(p(2023, 5), p(2023, 5)),
            FetchOptions::default(),
        )
        .await?;

        assert!(report.entries.is_empty());
        assert_eq!(fetcher.request_count(), 0);
        Ok(())
    }
}
