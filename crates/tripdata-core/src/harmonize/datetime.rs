//! Timestamp normalisation for harmonized records.
//!
//! Calendar convention: every timestamp is treated as the naive wall-clock
//! time of record. Source columns carry no reliable timezone, so:
//!
//! - Arrow timestamps keep their stored value; any timezone annotation on
//!   the column is dropped without conversion.
//! - Text timestamps are parsed as naive date-times.
//! - `pickup_hour` is the wall-clock hour (0-23) and `pickup_dayofweek`
//!   counts from Monday = 0 to Sunday = 6.
//!
//! The canonical in-memory representation is
//! `Timestamp(Microsecond, None)`; sub-microsecond precision is floored.

use arrow::{
    array::{Array, ArrayRef, AsArray},
    datatypes::{
        DataType, Date32Type, Date64Type, TimeUnit, TimestampMicrosecondType,
        TimestampMillisecondType, TimestampNanosecondType, TimestampSecondType,
    },
};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};

/// Arrow type of every canonical timestamp column.
pub fn canonical_timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, None)
}

const TEXT_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parse one textual timestamp. Returns `None` for anything unparseable.
pub fn parse_text_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    TEXT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn from_micros(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros).map(|dt| dt.naive_utc())
}

fn scale_to_micros(unit: TimeUnit, value: i64) -> Option<i64> {
    match unit {
        TimeUnit::Second => value.checked_mul(1_000_000),
        TimeUnit::Millisecond => value.checked_mul(1_000),
        TimeUnit::Microsecond => Some(value),
        TimeUnit::Nanosecond => Some(value.div_euclid(1_000)),
    }
}

/// Whether a column of this type can hold pickup/dropoff times.
pub fn is_temporal_source(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Timestamp(_, _)
            | DataType::Date32
            | DataType::Date64
            | DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Utf8View
    )
}

/// Interpret every value of `array` as a naive date-time.
///
/// Nulls, unparseable text and values outside chrono's range become `None`.
/// Columns of a non-temporal type yield all `None`.
pub fn to_naive(array: &ArrayRef) -> Vec<Option<NaiveDateTime>> {
    fn collect<I>(iter: I) -> Vec<Option<NaiveDateTime>>
    where
        I: Iterator<Item = Option<NaiveDateTime>>,
    {
        iter.collect()
    }

    macro_rules! timestamps {
        ($ty:ty, $unit:expr) => {
            collect(
                array
                    .as_primitive::<$ty>()
                    .iter()
                    .map(|v| v.and_then(|v| scale_to_micros($unit, v)).and_then(from_micros)),
            )
        };
    }

    match array.data_type() {
        DataType::Timestamp(TimeUnit::Second, _) => {
            timestamps!(TimestampSecondType, TimeUnit::Second)
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            timestamps!(TimestampMillisecondType, TimeUnit::Millisecond)
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            timestamps!(TimestampMicrosecondType, TimeUnit::Microsecond)
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            timestamps!(TimestampNanosecondType, TimeUnit::Nanosecond)
        }
        DataType::Date32 => collect(
            array
                .as_primitive::<Date32Type>()
                .iter()
                .map(|v| {
                    v.and_then(|days| i64::from(days).checked_mul(86_400_000_000))
                        .and_then(from_micros)
                }),
        ),
        DataType::Date64 => collect(
            array
                .as_primitive::<Date64Type>()
                .iter()
                .map(|v| v.and_then(|ms| ms.checked_mul(1_000)).and_then(from_micros)),
        ),
        DataType::Utf8 => collect(
            array
                .as_string::<i32>()
                .iter()
                .map(|v| v.and_then(parse_text_timestamp)),
        ),
        DataType::LargeUtf8 => collect(
            array
                .as_string::<i64>()
                .iter()
                .map(|v| v.and_then(parse_text_timestamp)),
        ),
        DataType::Utf8View => collect(
            array
                .as_string_view()
                .iter()
                .map(|v| v.and_then(parse_text_timestamp)),
        ),
        _ => vec![None; array.len()],
    }
}

/// Canonical microsecond value of a naive date-time.
pub fn to_micros(dt: &NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_micros()
}

/// Wall-clock hour, 0-23.
pub fn pickup_hour(dt: &NaiveDateTime) -> i32 {
    dt.hour() as i32
}

/// Day of week, Monday = 0 ... Sunday = 6.
pub fn pickup_dayofweek(dt: &NaiveDateTime) -> i32 {
    dt.weekday().num_days_from_monday() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{StringArray, TimestampNanosecondArray, TimestampSecondArray};

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").expect("valid datetime")
    }

    #[test]
    fn parses_common_text_forms() {
        assert_eq!(
            parse_text_timestamp("2023-04-01 08:15:00"),
            Some(dt("2023-04-01 08:15:00"))
        );
        assert_eq!(
            parse_text_timestamp("2023-04-01T08:15:00.250"),
            Some(dt("2023-04-01 08:15:00") + chrono::Duration::milliseconds(250))
        );
        assert_eq!(
            parse_text_timestamp("2023-04-01"),
            Some(dt("2023-04-01 00:00:00"))
        );
        assert_eq!(parse_text_timestamp("not a date"), None);
        assert_eq!(parse_text_timestamp("   "), None);
    }

    #[test]
    fn timezone_annotation_is_not_applied() {
        // 2023-04-01 08:15:00 as epoch seconds.
        let secs = dt("2023-04-01 08:15:00").and_utc().timestamp();
        let array: ArrayRef = Arc::new(
            TimestampSecondArray::from(vec![Some(secs), None])
                .with_timezone("America/New_York"),
        );
        let out = to_naive(&array);
        assert_eq!(out, vec![Some(dt("2023-04-01 08:15:00")), None]);
    }

    #[test]
    fn nanoseconds_floor_to_micros() {
        let base = dt("2023-04-01 08:15:00").and_utc().timestamp_nanos_opt().unwrap_or_default();
        let array: ArrayRef = Arc::new(TimestampNanosecondArray::from(vec![base + 1_999]));
        let out = to_naive(&array);
        assert_eq!(out[0].map(|v| to_micros(&v)), Some(base / 1_000 + 1));
    }

    #[test]
    fn text_column_marks_garbage_as_none() {
        let array: ArrayRef = Arc::new(StringArray::from(vec![
            Some("2023-04-03 23:59:59"),
            Some("garbage"),
            None,
        ]));
        let out = to_naive(&array);
        assert_eq!(out, vec![Some(dt("2023-04-03 23:59:59")), None, None]);
    }

    #[test]
    fn derived_fields_use_monday_zero() {
        // 2023-04-03 was a Monday, 2023-04-09 a Sunday.
        let monday = dt("2023-04-03 00:30:00");
        let sunday = dt("2023-04-09 23:10:00");
        assert_eq!((pickup_hour(&monday), pickup_dayofweek(&monday)), (0, 0));
        assert_eq!((pickup_hour(&sunday), pickup_dayofweek(&sunday)), (23, 6));
    }
}
