//! Core engine for incremental ingestion of monthly trip-record data.
//!
//! This crate provides every stage of the `tripdata` pipeline:
//!
//! - Calendar-month arithmetic for watermarks and target ranges (`period`).
//! - A persisted ingestion watermark and a single-instance run lock
//!   (`watermark`, `lock`).
//! - Retrieval of raw monthly artifacts through a pluggable `Fetcher`
//!   capability, with an HTTP implementation (`fetch`).
//! - Harmonization of the two provider layouts into one canonical record
//!   shape (`variant`, `harmonize`).
//! - A whole-corpus combiner that unions schemas and rejects type drift
//!   (`combine`), plus Avro and CSV exporters (`export`).
//! - The orchestrating state machine that ties the stages together and
//!   advances the watermark only on full success (`pipeline`).
//!
//! All artifacts live under a data root addressed through `storage`; the
//! command-line driver in `tripdata-cli` builds a `PipelineConfig` and
//! calls `Pipeline::run`.
#![deny(missing_docs)]
pub mod combine;
pub mod export;
pub mod fetch;
pub mod harmonize;
pub mod lock;
pub mod period;
pub mod pipeline;
pub mod storage;
pub mod variant;
pub mod watermark;

#[cfg(test)]
pub(crate) mod test_util;
