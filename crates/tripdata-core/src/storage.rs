//! Artifact storage.
//!
//! This module is the "object store" capability of the pipeline. It maps a
//! data root to the locations of raw, normalized, combined and export
//! artifacts (see [`layout`]) and provides the small set of byte-level
//! operations the stages need:
//!
//! - whole-object reads ([`read_all_bytes`], [`read_to_string`]),
//! - atomic whole-object writes ([`write_atomic`]),
//! - create-only-if-absent writes used by the run lock ([`write_new`]),
//! - streaming writes through a temp-file-then-rename sink
//!   ([`open_output_sink`]) for Arrow/Avro writers that need
//!   `std::io::Write`,
//! - listing a directory ([`list_files`]).
//!
//! Only the local filesystem is supported, but callers go through
//! [`StorageLocation`] so another backend can be slotted in without
//! touching stage logic.

mod error;
pub mod layout;
mod output;

use std::{
    io,
    path::{Path, PathBuf},
};

use snafu::{Backtrace, prelude::*};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

pub use error::{BackendError, StorageError};
pub(crate) use error::OtherIoSnafu;
pub use output::{OutputSink, open_output_sink};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root location of the artifact store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageLocation {
    /// A store rooted at a local filesystem directory.
    Local(PathBuf),
}

impl StorageLocation {
    /// Creates a new `StorageLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StorageLocation::Local(root.into())
    }

    /// Absolute path of `rel` under this location.
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        join_local(self, rel)
    }
}

pub(crate) fn join_local(location: &StorageLocation, rel: &Path) -> PathBuf {
    match location {
        StorageLocation::Local(root) => root.join(rel),
    }
}

pub(crate) async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
pub(crate) struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Call after a successful rename.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Temp path next to `abs`, keeping the original extension visible.
pub(crate) fn tmp_path_for(abs: &Path) -> PathBuf {
    let mut name = abs
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    abs.with_file_name(name)
}

fn classify(abs: &Path, e: io::Error) -> StorageError {
    let path = abs.display().to_string();
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        _ => StorageError::OtherIo {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
    }
}

/// Write `contents` to `rel_path` inside `location` using an atomic write.
///
/// Writes to a temporary sibling, syncs it, then renames it into place, so
/// readers observe either the previous object or the new one, never a
/// torn write. Parent directories are created as needed.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = join_local(location, rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = tmp_path_for(&abs);
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| classify(&tmp_path, e))?;

        file.write_all(contents)
            .await
            .map_err(|e| classify(&tmp_path, e))?;

        file.sync_all()
            .await
            .map_err(|e| classify(&tmp_path, e))?;
    }

    fs::rename(&tmp_path, &abs)
        .await
        .map_err(|e| classify(&abs, e))?;

    guard.disarm();
    Ok(())
}

/// Create a *new* file at `rel_path` and write `contents`, failing with
/// [`StorageError::AlreadyExists`] if the file is already there.
pub async fn write_new(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = join_local(location, rel_path);
    create_parent_dir(&abs).await?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await
        .map_err(|e| classify(&abs, e))?;

    file.write_all(contents)
        .await
        .map_err(|e| classify(&abs, e))?;

    file.sync_all().await.map_err(|e| classify(&abs, e))?;

    Ok(())
}

/// Read the file at `rel_path` as UTF-8 text.
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = join_local(location, rel_path);
    fs::read_to_string(&abs)
        .await
        .map_err(|e| classify(&abs, e))
}

/// Read the full contents of the file at `rel_path`.
pub async fn read_all_bytes(location: &StorageLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = join_local(location, rel_path);
    fs::read(&abs).await.map_err(|e| classify(&abs, e))
}

/// List regular files directly under `rel_dir`, returned as paths relative
/// to the location root and sorted by name.
///
/// A missing directory is treated as empty.
pub async fn list_files(location: &StorageLocation, rel_dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let abs_dir = join_local(location, rel_dir);

    let mut entries = match fs::read_dir(&abs_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(classify(&abs_dir, e)),
    };

    let mut out = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| classify(&abs_dir, e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| classify(&entry.path(), e))?;
        if file_type.is_file() {
            out.push(rel_dir.join(entry.file_name()));
        }
    }

    out.sort();
    Ok(out)
}
