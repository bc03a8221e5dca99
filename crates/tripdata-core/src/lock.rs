//! Single-instance run lock.
//!
//! The watermark store cannot tolerate concurrent runs, so a run first
//! creates a lock file at the data root with create-new semantics. A second
//! run that finds the file fails fast instead of racing. The lock is
//! released when the guard is dropped.
//!
//! A crashed run leaves the file behind; it must be removed by hand after
//! confirming no run is active.

use std::path::PathBuf;

use snafu::prelude::*;

use crate::storage::{self, StorageError, StorageLocation, layout};

/// Errors raised while acquiring the run lock.
#[derive(Debug, Snafu)]
pub enum LockError {
    /// Another run holds the lock.
    #[snafu(display("Another pipeline run holds the lock at {path}"))]
    Locked {
        /// Absolute path of the lock file.
        path: String,
    },

    /// Creating the lock file failed for another reason.
    #[snafu(display("Failed to create run lock: {source}"))]
    Acquire {
        /// Underlying storage error.
        source: StorageError,
    },
}

/// Guard holding the run lock; dropping it removes the lock file.
#[derive(Debug)]
pub struct RunLock {
    abs_path: PathBuf,
}

impl RunLock {
    /// Acquire the lock at the conventional path under `location`.
    pub async fn acquire(location: &StorageLocation) -> Result<RunLock, LockError> {
        let rel = layout::lock_rel_path();
        let abs_path = location.resolve(&rel);
        let contents = format!("pid={}\n", std::process::id());

        match storage::write_new(location, &rel, contents.as_bytes()).await {
            Ok(()) => Ok(RunLock { abs_path }),
            Err(StorageError::AlreadyExists { .. }) => LockedSnafu {
                path: abs_path.display().to_string(),
            }
            .fail(),
            Err(source) => Err(LockError::Acquire { source }),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.abs_path) {
            log::warn!(
                "failed to remove run lock {}: {e}",
                self.abs_path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn second_acquire_fails_until_first_is_dropped() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        let first = RunLock::acquire(&location).await?;
        let err = RunLock::acquire(&location)
            .await
            .expect_err("lock should be held");
        assert!(matches!(err, LockError::Locked { .. }));

        drop(first);
        assert!(!tmp.path().join(layout::LOCK_FILE_NAME).exists());
        let _again = RunLock::acquire(&location).await?;
        Ok(())
    }
}
