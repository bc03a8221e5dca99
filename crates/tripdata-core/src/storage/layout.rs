//! On-disk layout helpers for a data root.
//!
//! All *relative* path conventions live here:
//! - raw artifacts (`raw/`), one per `(variant, period)`,
//! - normalized artifacts (`processed/`), 1:1 with raw artifacts,
//! - the combined dataset and its exports (`combined/`),
//! - the run lock.
//!
//! Per-period artifact names encode their key, so a directory listing can be
//! turned back into keys with [`ArtifactKey::from_file_name`].

use std::path::{Path, PathBuf};

use crate::{period::Period, variant::SourceVariant};

/// Directory holding fetched, unmodified source files.
pub const RAW_DIR_NAME: &str = "raw";

/// Directory holding harmonized per-period files.
pub const NORMALIZED_DIR_NAME: &str = "processed";

/// Directory holding the combined dataset and its exports.
pub const COMBINED_DIR_NAME: &str = "combined";

/// Base file name (without extension) of the combined dataset.
pub const COMBINED_STEM: &str = "all_trip_data";

/// Name of the single-instance lock file under the data root.
pub const LOCK_FILE_NAME: &str = ".tripdata.lock";

const ARTIFACT_INFIX: &str = "_tripdata_";
const PARQUET_EXT: &str = "parquet";

/// Which per-period corpus an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// As fetched from the provider.
    Raw,
    /// Output of the harmonizer.
    Normalized,
}

impl ArtifactKind {
    /// Relative directory for this kind.
    pub fn rel_dir(&self) -> PathBuf {
        match self {
            ArtifactKind::Raw => PathBuf::from(RAW_DIR_NAME),
            ArtifactKind::Normalized => PathBuf::from(NORMALIZED_DIR_NAME),
        }
    }
}

/// Address of a per-period artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactKey {
    /// Period the records belong to.
    pub period: Period,
    /// Provider the records came from.
    pub variant: SourceVariant,
}

impl ArtifactKey {
    /// Build a key.
    pub fn new(variant: SourceVariant, period: Period) -> Self {
        Self { period, variant }
    }

    /// `{variant}_tripdata_{YYYY-MM}.parquet`
    pub fn file_name(&self) -> String {
        format!(
            "{}{ARTIFACT_INFIX}{}.{PARQUET_EXT}",
            self.variant, self.period
        )
    }

    /// Relative path of this artifact in the given corpus.
    pub fn rel_path(&self, kind: ArtifactKind) -> PathBuf {
        kind.rel_dir().join(self.file_name())
    }

    /// Parse a key back out of an artifact file name. Returns `None` for
    /// anything that is not a well-formed artifact name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(PARQUET_EXT)?.strip_suffix('.')?;
        let (variant, period) = stem.split_once(ARTIFACT_INFIX)?;
        Some(Self {
            variant: variant.parse().ok()?,
            period: period.parse().ok()?,
        })
    }

    /// Parse a key from the last component of `path`.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::from_file_name)
    }
}

/// Relative path: `combined/all_trip_data.parquet`
pub fn combined_rel_path() -> PathBuf {
    PathBuf::from(COMBINED_DIR_NAME).join(format!("{COMBINED_STEM}.{PARQUET_EXT}"))
}

/// Relative path: `combined/all_trip_data.avro`
pub fn avro_export_rel_path() -> PathBuf {
    PathBuf::from(COMBINED_DIR_NAME).join(format!("{COMBINED_STEM}.avro"))
}

/// Relative path: `combined/all_trip_data.csv`
pub fn csv_export_rel_path() -> PathBuf {
    PathBuf::from(COMBINED_DIR_NAME).join(format!("{COMBINED_STEM}.csv"))
}

/// Relative path: `.tripdata.lock`
pub fn lock_rel_path() -> PathBuf {
    PathBuf::from(LOCK_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(variant: SourceVariant, year: i32, month: u32) -> ArtifactKey {
        ArtifactKey::new(variant, Period::new(year, month).expect("valid period"))
    }

    #[test]
    fn file_names_encode_the_key() {
        let k = key(SourceVariant::Green, 2023, 4);
        assert_eq!(k.file_name(), "green_tripdata_2023-04.parquet");
        assert_eq!(
            k.rel_path(ArtifactKind::Normalized),
            PathBuf::from("processed/green_tripdata_2023-04.parquet")
        );
        assert_eq!(
            ArtifactKey::from_file_name("green_tripdata_2023-04.parquet"),
            Some(k)
        );
    }

    #[test]
    fn foreign_files_are_not_keys() {
        for name in [
            "notes.txt",
            "green_tripdata_2023-04.parquet.tmp",
            "purple_tripdata_2023-04.parquet",
            "yellow_tripdata_2023-13.parquet",
            "yellow-2023-04.parquet",
        ] {
            assert_eq!(ArtifactKey::from_file_name(name), None, "{name}");
        }
    }

    #[test]
    fn keys_sort_by_period_then_variant() {
        let mut keys = vec![
            key(SourceVariant::Green, 2023, 5),
            key(SourceVariant::Yellow, 2023, 5),
            key(SourceVariant::Yellow, 2023, 4),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                key(SourceVariant::Yellow, 2023, 4),
                key(SourceVariant::Yellow, 2023, 5),
                key(SourceVariant::Green, 2023, 5),
            ]
        );
    }
}
