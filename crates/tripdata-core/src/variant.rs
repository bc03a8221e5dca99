//! Source variants and layout detection.
//!
//! Trip records arrive from two providers whose files carry the same
//! information under different column names. A [`SourceVariant`] names the
//! provider (it is part of every artifact key and becomes the
//! `source_variant` column), while [`detect_variant`] inspects an actual file
//! schema and reports which layout it follows.

use std::{fmt, str::FromStr};

use arrow::datatypes::Schema;
use snafu::prelude::*;

/// One of the two upstream trip-data providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceVariant {
    /// Yellow-cab records (`tpep_*` datetime columns).
    Yellow,
    /// Green-cab records (`lpep_*` datetime columns).
    Green,
}

impl SourceVariant {
    /// Both variants, in fetch order.
    pub const ALL: [SourceVariant; 2] = [SourceVariant::Yellow, SourceVariant::Green];

    /// Stable lowercase name, used in file names and the `source_variant`
    /// column.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceVariant::Yellow => "yellow",
            SourceVariant::Green => "green",
        }
    }

    /// Source column holding the pickup timestamp.
    pub fn pickup_column(&self) -> &'static str {
        match self {
            SourceVariant::Yellow => "tpep_pickup_datetime",
            SourceVariant::Green => "lpep_pickup_datetime",
        }
    }

    /// Source column holding the dropoff timestamp.
    pub fn dropoff_column(&self) -> &'static str {
        match self {
            SourceVariant::Yellow => "tpep_dropoff_datetime",
            SourceVariant::Green => "lpep_dropoff_datetime",
        }
    }
}

impl fmt::Display for SourceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown variant name.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("unknown source variant '{name}' (expected yellow|green)"))]
pub struct ParseVariantError {
    name: String,
}

impl FromStr for SourceVariant {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yellow" => Ok(SourceVariant::Yellow),
            "green" => Ok(SourceVariant::Green),
            other => ParseVariantSnafu { name: other }.fail(),
        }
    }
}

/// Outcome of inspecting a raw file's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedLayout {
    /// The schema follows the given variant's column naming.
    Known(SourceVariant),
    /// Neither variant's pickup column is present.
    Unknown,
}

/// Decide which provider layout `schema` follows, keyed on the pickup
/// datetime column.
///
/// If a file somehow carries both pickup columns, the yellow layout wins;
/// the order is fixed so detection is deterministic.
pub fn detect_variant(schema: &Schema) -> DetectedLayout {
    SourceVariant::ALL
        .into_iter()
        .find(|v| schema.column_with_name(v.pickup_column()).is_some())
        .map_or(DetectedLayout::Unknown, DetectedLayout::Known)
}
