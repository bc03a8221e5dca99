//! Calendar-month arithmetic.
//!
//! Every unit of work in the pipeline is one calendar month. This module
//! defines the [`Period`] value (a validated `(year, month)` pair) and the
//! inclusive [`PeriodRange`] the orchestrator hands to the fetcher.
//!
//! Semantics:
//!
//! - Periods are totally ordered in calendar order (`2023-12 < 2024-01`).
//! - `Display` renders `YYYY-MM`; this is also the persisted watermark
//!   format, so it must stay stable.
//! - A range is inclusive on both ends. `start > end` is a valid, empty
//!   range rather than an error.

use std::{fmt, num::ParseIntError, str::FromStr};

use chrono::Datelike;
use snafu::prelude::*;

/// Earliest year a [`Period`] may hold.
pub const MIN_YEAR: i32 = 1;
/// Latest year a [`Period`] may hold.
pub const MAX_YEAR: i32 = 9999;

/// Errors returned when building or parsing a [`Period`].
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum PeriodError {
    /// Year outside the four-digit range `YYYY` can express.
    #[snafu(display("year {year} is out of range (expected {MIN_YEAR}..={MAX_YEAR})"))]
    YearOutOfRange {
        /// The rejected year.
        year: i32,
    },

    /// Month outside `1..=12`.
    #[snafu(display("month {month} is out of range (expected 1..=12)"))]
    MonthOutOfRange {
        /// The rejected month number.
        month: u32,
    },

    /// The text was not of the form `YYYY-MM`.
    #[snafu(display("invalid period '{input}' (expected YYYY-MM)"))]
    Malformed {
        /// The original input.
        input: String,
    },

    /// One of the numeric components failed to parse.
    #[snafu(display("invalid number in period '{input}': {source}"))]
    InvalidNumber {
        /// The original input.
        input: String,
        /// Underlying integer parse error.
        source: ParseIntError,
    },
}

/// A single calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// Build a period, validating that `year` is in `MIN_YEAR..=MAX_YEAR`
    /// and `month` is in `1..=12`.
    pub fn new(year: i32, month: u32) -> Result<Self, PeriodError> {
        ensure!(
            (MIN_YEAR..=MAX_YEAR).contains(&year),
            YearOutOfRangeSnafu { year }
        );
        ensure!((1..=12).contains(&month), MonthOutOfRangeSnafu { month });
        Ok(Self { year, month })
    }

    /// The calendar period containing `date`.
    pub fn from_date(date: impl Datelike) -> Self {
        Self {
            year: date.year().clamp(MIN_YEAR, MAX_YEAR),
            month: date.month(),
        }
    }

    /// Calendar year.
    pub fn year(&self) -> i32 {
        self.year
    }

    /// Calendar month, `1..=12`.
    pub fn month(&self) -> u32 {
        self.month
    }

    /// The month immediately after this one. The year is bounded by
    /// construction, so this cannot overflow.
    pub fn succ(&self) -> Period {
        if self.month == 12 {
            Period {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Period {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let text = input.trim();
        let Some((year_str, month_str)) = text.split_once('-') else {
            return MalformedSnafu { input: text }.fail();
        };

        if year_str.is_empty() || month_str.is_empty() {
            return MalformedSnafu { input: text }.fail();
        }

        let year: i32 = year_str
            .parse()
            .context(InvalidNumberSnafu { input: text })?;
        let month: u32 = month_str
            .parse()
            .context(InvalidNumberSnafu { input: text })?;

        Period::new(year, month)
    }
}

/// Inclusive range of calendar months `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodRange {
    start: Period,
    end: Period,
}

impl PeriodRange {
    /// Build a range. `start > end` produces an empty range.
    pub fn new(start: Period, end: Period) -> Self {
        Self { start, end }
    }

    /// The range of months strictly after `watermark` up to and including
    /// `current`.
    pub fn after(watermark: Period, current: Period) -> Self {
        Self::new(watermark.succ(), current)
    }

    /// First month of the range.
    pub fn start(&self) -> Period {
        self.start
    }

    /// Last month of the range.
    pub fn end(&self) -> Period {
        self.end
    }

    /// `true` when there is nothing to ingest.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Number of months covered.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let months = |p: Period| i64::from(p.year) * 12 + i64::from(p.month) - 1;
        (months(self.end) - months(self.start) + 1) as usize
    }

    /// Iterate months in calendar order.
    pub fn iter(&self) -> PeriodIter {
        PeriodIter {
            next: (!self.is_empty()).then_some(self.start),
            end: self.end,
        }
    }
}

impl fmt::Display for PeriodRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "(empty)")
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

impl IntoIterator for PeriodRange {
    type Item = Period;
    type IntoIter = PeriodIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the months of a [`PeriodRange`].
#[derive(Debug, Clone)]
pub struct PeriodIter {
    next: Option<Period>,
    end: Period,
}

impl Iterator for PeriodIter {
    type Item = Period;

    fn next(&mut self) -> Option<Period> {
        let current = self.next?;
        self.next = (current < self.end).then(|| current.succ());
        Some(current)
    }
}
